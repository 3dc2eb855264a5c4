use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Prefix of the optional third-party scope segment, e.g. `:POST_42`.
pub const SCOPE_PREFIX: &str = "POST_";

const SEPARATOR: char = ':';

/// The participants (and optional scope) a room id is derived from.
///
/// Room ids are always `dealerEmail:technicianEmail[:POST_<scope>]`, so two
/// clients that know the same participants resolve the same room regardless
/// of who opens it first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomKey {
    pub dealer_email: String,
    pub technician_email: String,
    pub scope_id: Option<String>,
}

impl RoomKey {
    pub fn new(
        dealer_email: &str,
        technician_email: &str,
        scope_id: Option<&str>,
    ) -> Result<Self, RelayError> {
        let dealer_email = dealer_email.trim();
        let technician_email = technician_email.trim();
        validate_email("dealerEmail", dealer_email)?;
        validate_email("technicianEmail", technician_email)?;

        let scope_id = match scope_id.map(str::trim) {
            None | Some("") => None,
            Some(scope) if scope.contains(SEPARATOR) => {
                return Err(RelayError::InvalidParticipants(format!(
                    "scope id must not contain '{SEPARATOR}'"
                )));
            }
            Some(scope) => Some(scope.to_string()),
        };

        Ok(Self {
            dealer_email: dealer_email.to_string(),
            technician_email: technician_email.to_string(),
            scope_id,
        })
    }

    pub fn room_id(&self) -> String {
        match &self.scope_id {
            Some(scope) => format!(
                "{}{SEPARATOR}{}{SEPARATOR}{SCOPE_PREFIX}{}",
                self.dealer_email, self.technician_email, scope
            ),
            None => format!("{}{SEPARATOR}{}", self.dealer_email, self.technician_email),
        }
    }

    /// Recover the participants from a composite room id.
    ///
    /// Only used when a payload does not carry the participants explicitly.
    pub fn parse(room_id: &str) -> Result<Self, RelayError> {
        let parts: Vec<&str> = room_id.split(SEPARATOR).collect();
        match parts.as_slice() {
            [dealer, technician] => Self::new(dealer, technician, None),
            [dealer, technician, scope] => {
                let scope = scope.strip_prefix(SCOPE_PREFIX).ok_or_else(|| {
                    RelayError::InvalidParticipants(format!(
                        "room id {room_id} has a malformed scope segment"
                    ))
                })?;
                if scope.is_empty() {
                    return Err(RelayError::InvalidParticipants(format!(
                        "room id {room_id} has an empty scope segment"
                    )));
                }
                Self::new(dealer, technician, Some(scope))
            }
            _ => Err(RelayError::InvalidParticipants(format!(
                "room id {room_id} is not dealer:technician[:{SCOPE_PREFIX}<id>]"
            ))),
        }
    }

    pub fn involves(&self, email: &str) -> bool {
        self.dealer_email == email || self.technician_email == email
    }

    pub fn participants(&self) -> [&str; 2] {
        [&self.dealer_email, &self.technician_email]
    }
}

fn validate_email(field: &str, email: &str) -> Result<(), RelayError> {
    if email.is_empty() {
        return Err(RelayError::InvalidParticipants(format!("{field} is empty")));
    }
    if email.contains(SEPARATOR) {
        return Err(RelayError::InvalidParticipants(format!(
            "{field} must not contain '{SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Pure room id derivation; no I/O.
pub fn compute_room_id(
    dealer_email: &str,
    technician_email: &str,
    scope_id: Option<&str>,
) -> Result<String, RelayError> {
    Ok(RoomKey::new(dealer_email, technician_email, scope_id)?.room_id())
}

/// Persisted room record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub dealer_email: String,
    pub technician_email: String,
    pub scope_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_is_dealer_then_technician() {
        let id = compute_room_id("dealer@x.com", "tech@x.com", None).unwrap();
        assert_eq!(id, "dealer@x.com:tech@x.com");
    }

    #[test]
    fn surrounding_whitespace_does_not_change_the_room() {
        let padded = compute_room_id(" dealer@x.com ", "tech@x.com\t", None).unwrap();
        assert_eq!(padded, "dealer@x.com:tech@x.com");

        let key = RoomKey::new("dealer@x.com  ", "tech@x.com", None).unwrap();
        assert_eq!(key.dealer_email, "dealer@x.com");
        assert!(key.involves("dealer@x.com"));
    }

    #[test]
    fn room_id_is_stable_for_either_initiator() {
        // Both sides pass the participants by role, never by "me/them".
        let from_dealer = compute_room_id("dealer@x.com", "tech@x.com", Some("7")).unwrap();
        let from_tech = RoomKey::new("dealer@x.com", "tech@x.com", Some("7"))
            .unwrap()
            .room_id();
        assert_eq!(from_dealer, from_tech);
        assert_eq!(from_dealer, "dealer@x.com:tech@x.com:POST_7");
    }

    #[test]
    fn blank_scope_is_ignored() {
        let id = compute_room_id("d@x.com", "t@x.com", Some("  ")).unwrap();
        assert_eq!(id, "d@x.com:t@x.com");
    }

    #[test]
    fn empty_participant_is_rejected() {
        let err = compute_room_id("", "tech@x.com", None).unwrap_err();
        assert!(matches!(err, RelayError::InvalidParticipants(_)));

        let err = compute_room_id("dealer@x.com", "   ", None).unwrap_err();
        assert!(matches!(err, RelayError::InvalidParticipants(_)));
    }

    #[test]
    fn colon_in_email_is_rejected() {
        let err = compute_room_id("a:b@x.com", "tech@x.com", None).unwrap_err();
        assert!(matches!(err, RelayError::InvalidParticipants(_)));
    }

    #[test]
    fn parse_strips_scope_suffix() {
        let key = RoomKey::parse("dealer@x.com:tech@x.com:POST_99").unwrap();
        assert_eq!(key.dealer_email, "dealer@x.com");
        assert_eq!(key.technician_email, "tech@x.com");
        assert_eq!(key.scope_id.as_deref(), Some("99"));
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(RoomKey::parse("only-one-part").is_err());
        assert!(RoomKey::parse("d@x.com:t@x.com:JOB_1").is_err());
        assert!(RoomKey::parse("d@x.com:t@x.com:POST_").is_err());
        assert!(RoomKey::parse("a:b:c:d").is_err());
    }

    #[test]
    fn involves_matches_either_participant() {
        let key = RoomKey::new("dealer@x.com", "tech@x.com", None).unwrap();
        assert!(key.involves("tech@x.com"));
        assert!(key.involves("dealer@x.com"));
        assert!(!key.involves("other@x.com"));
    }
}
