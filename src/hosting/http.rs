//! JSON-over-HTTP client for the hosting provider
//!
//! Every request carries a bearer token and is bounded by the configured
//! request timeout. Ids come back as either numbers or strings, so they are
//! normalised to strings here.

use crate::config::HostingSettings;
use crate::error::Result;
use crate::hosting::api::{
    CreateMatchRequest, CreatedMatch, CreatedTeams, HostedMatchStatus, HostedRoster,
    HostingApi, HostingError, HostingServer,
};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Hosting provider client
#[derive(Debug, Clone)]
pub struct HttpHostingApi {
    client: Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct ServerRecord {
    id: Value,
    #[serde(alias = "ip_string")]
    ip: String,
    port: u16,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    id: Option<Value>,
}

impl HttpHostingApi {
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .context("Failed to build hosting API client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        })
    }

    pub fn from_settings(settings: &HostingSettings) -> Result<Self> {
        Self::new(
            &settings.base_url,
            &settings.api_token,
            Duration::from_secs(settings.request_timeout_seconds),
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!("Hosting API {} {}", method, url);
        self.client
            .request(method, url)
            .bearer_auth(&self.api_token)
    }

    async fn send(&self, builder: RequestBuilder) -> std::result::Result<Response, HostingError> {
        builder
            .send()
            .await
            .map_err(|e| HostingError::Transport(e.to_string()))
    }

    async fn expect_success(response: Response) -> std::result::Result<Response, HostingError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(HostingError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn create_team(&self, roster: &HostedRoster) -> std::result::Result<String, HostingError> {
        let members: Vec<String> = roster.player_ids.iter().map(u64::to_string).collect();
        let body = json!({
            "name": roster.name,
            "public_team": false,
            "members": members,
        });

        let response = self
            .send(self.request(Method::POST, "teams").json(&body))
            .await?;
        let record: CreatedRecord = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| HostingError::Malformed(e.to_string()))?;

        record
            .id
            .as_ref()
            .and_then(id_to_string)
            .ok_or_else(|| HostingError::Malformed("team response has no id".to_string()))
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl HostingApi for HttpHostingApi {
    async fn list_available_servers(&self) -> std::result::Result<Vec<HostingServer>, HostingError> {
        let response = self
            .send(self.request(Method::GET, "servers/available"))
            .await?;
        let records: Vec<ServerRecord> = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| HostingError::Malformed(e.to_string()))?;

        records
            .into_iter()
            .map(|record| {
                let id = id_to_string(&record.id)
                    .ok_or_else(|| HostingError::Malformed("server without id".to_string()))?;
                Ok(HostingServer {
                    id,
                    ip: record.ip,
                    port: record.port,
                    display_name: record.display_name,
                })
            })
            .collect()
    }

    async fn create_teams(
        &self,
        challenger: &HostedRoster,
        challenged: &HostedRoster,
    ) -> std::result::Result<CreatedTeams, HostingError> {
        let challenger_external_id = self.create_team(challenger).await?;
        let challenged_external_id = match self.create_team(challenged).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = self
                    .delete_teams(std::slice::from_ref(&challenger_external_id))
                    .await
                {
                    warn!(
                        "Failed to delete half-created team {}: {}",
                        challenger_external_id, cleanup
                    );
                }
                return Err(e);
            }
        };

        Ok(CreatedTeams {
            challenger_external_id,
            challenged_external_id,
        })
    }

    async fn create_match(
        &self,
        request: &CreateMatchRequest,
    ) -> std::result::Result<CreatedMatch, HostingError> {
        let response = self
            .send(self.request(Method::POST, "matches").json(request))
            .await?;
        let record: CreatedRecord = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| HostingError::Malformed(e.to_string()))?;

        Ok(CreatedMatch {
            id: record.id.as_ref().and_then(id_to_string),
        })
    }

    async fn get_match(
        &self,
        external_match_id: &str,
    ) -> std::result::Result<Option<HostedMatchStatus>, HostingError> {
        let path = format!("matches/{}", external_match_id);
        let response = self.send(self.request(Method::GET, &path)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = Self::expect_success(response)
            .await?
            .json::<HostedMatchStatus>()
            .await
            .map_err(|e| HostingError::Malformed(e.to_string()))?;
        Ok(Some(status))
    }

    async fn cancel_match(&self, external_match_id: &str) -> std::result::Result<bool, HostingError> {
        let path = format!("matches/{}/cancel", external_match_id);
        let response = self.send(self.request(Method::POST, &path)).await?;
        Ok(response.status().is_success())
    }

    async fn send_rcon_command(
        &self,
        external_match_id: &str,
        command: &str,
    ) -> std::result::Result<bool, HostingError> {
        let path = format!("matches/{}/rcon", external_match_id);
        let response = self
            .send(
                self.request(Method::POST, &path)
                    .json(&json!({ "command": command })),
            )
            .await?;
        Ok(response.status().is_success())
    }

    async fn delete_teams(&self, external_team_ids: &[String]) -> std::result::Result<(), HostingError> {
        for id in external_team_ids {
            let path = format!("teams/{}", id);
            let response = self.send(self.request(Method::DELETE, &path)).await?;
            if response.status() != StatusCode::NOT_FOUND {
                Self::expect_success(response).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_normalised_to_strings() {
        assert_eq!(id_to_string(&json!(42)), Some("42".to_string()));
        assert_eq!(id_to_string(&json!("abc")), Some("abc".to_string()));
        assert_eq!(id_to_string(&json!("")), None);
        assert_eq!(id_to_string(&json!(null)), None);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api =
            HttpHostingApi::new("http://hosting.local/api/", "token", Duration::from_secs(1))
                .unwrap();
        assert_eq!(api.base_url, "http://hosting.local/api");
    }

    #[test]
    fn test_server_record_accepts_ip_string_alias() {
        let record: ServerRecord = serde_json::from_value(json!({
            "id": 3,
            "ip_string": "10.0.0.5",
            "port": 27015
        }))
        .unwrap();
        assert_eq!(record.ip, "10.0.0.5");
        assert_eq!(record.display_name, "");
    }

    #[test]
    fn test_match_status_parses_partial_payload() {
        let status: HostedMatchStatus = serde_json::from_value(json!({
            "cancelled": false,
            "forfeit": false,
            "end_time": "2024-05-01T20:00:00Z",
            "team1_score": 13,
            "team2_score": 9,
            "winner": "77"
        }))
        .unwrap();
        assert!(status.is_over());
        assert_eq!(status.winner.as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let api = HttpHostingApi::new("http://127.0.0.1:9", "t", Duration::from_millis(200))
            .unwrap();
        let err = api.list_available_servers().await.unwrap_err();
        assert!(matches!(err, HostingError::Transport(_)));
    }
}
