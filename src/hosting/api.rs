//! Contract with the external match-hosting provider

use crate::types::PlayerId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A game server the provider can put a match on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostingServer {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub display_name: String,
}

/// Roster mirrored to the provider as one of its teams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedRoster {
    pub name: String,
    pub player_ids: Vec<PlayerId>,
}

/// Provider-side ids of the two teams created for a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTeams {
    pub challenger_external_id: String,
    pub challenged_external_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMatchRequest {
    pub server_id: String,
    pub team1_id: String,
    pub team2_id: String,
    pub title: String,
    /// Map forced by a completed veto; `None` lets the server decide
    pub map: Option<String>,
    pub players_per_team: usize,
}

/// What the provider returned for a created match; `id` may be missing
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreatedMatch {
    pub id: Option<String>,
}

/// Provider view of a match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostedMatchStatus {
    pub cancelled: bool,
    pub forfeit: bool,
    pub end_time: Option<DateTime<Utc>>,
    pub team1_score: u32,
    pub team2_score: u32,
    /// Provider id of the winning team
    #[serde(deserialize_with = "optional_id")]
    pub winner: Option<String>,
}

/// Provider ids arrive as strings or bare numbers
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

fn optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Text(text)) if !text.is_empty() => Some(text),
        Some(RawId::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

impl HostedMatchStatus {
    /// Whether the provider considers the match over
    pub fn is_over(&self) -> bool {
        self.cancelled || self.forfeit || self.end_time.is_some()
    }
}

/// Failure talking to the hosting provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostingError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Narrow client surface of the hosting provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostingApi: Send + Sync {
    async fn list_available_servers(&self) -> Result<Vec<HostingServer>, HostingError>;

    async fn create_teams(
        &self,
        challenger: &HostedRoster,
        challenged: &HostedRoster,
    ) -> Result<CreatedTeams, HostingError>;

    async fn create_match(&self, request: &CreateMatchRequest)
        -> Result<CreatedMatch, HostingError>;

    /// `Ok(None)` when the provider does not know the match
    async fn get_match(
        &self,
        external_match_id: &str,
    ) -> Result<Option<HostedMatchStatus>, HostingError>;

    async fn cancel_match(&self, external_match_id: &str) -> Result<bool, HostingError>;

    /// Run a console command on the server hosting the match
    async fn send_rcon_command(
        &self,
        external_match_id: &str,
        command: &str,
    ) -> Result<bool, HostingError>;

    async fn delete_teams(&self, external_team_ids: &[String]) -> Result<(), HostingError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_winner_accepts_numeric_id() {
        let status: HostedMatchStatus = serde_json::from_value(json!({
            "end_time": "2024-05-01T20:00:00Z",
            "team1_score": 16,
            "team2_score": 12,
            "winner": 4411
        }))
        .unwrap();
        assert_eq!(status.winner.as_deref(), Some("4411"));
    }

    #[test]
    fn test_winner_missing_null_or_blank() {
        let missing: HostedMatchStatus = serde_json::from_value(json!({})).unwrap();
        assert_eq!(missing.winner, None);

        let null: HostedMatchStatus =
            serde_json::from_value(json!({ "winner": null })).unwrap();
        assert_eq!(null.winner, None);

        let blank: HostedMatchStatus = serde_json::from_value(json!({ "winner": "" })).unwrap();
        assert_eq!(blank.winner, None);
    }

    #[test]
    fn test_winner_rejects_other_shapes() {
        let result: Result<HostedMatchStatus, _> =
            serde_json::from_value(json!({ "winner": { "id": 1 } }));
        assert!(result.is_err());
    }
}
