use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of a dealer/technician conversation a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[serde(alias = "dealer", alias = "Dealer")]
    Dealer,
    #[serde(alias = "technician", alias = "Technician")]
    Technician,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dealer => "DEALER",
            Self::Technician => "TECHNICIAN",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("dealer") {
            Ok(Self::Dealer)
        } else if value.eq_ignore_ascii_case("technician") {
            Ok(Self::Technician)
        } else {
            Err(format!("unknown role: {value}"))
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (email, role) pair a connection registers as.
///
/// Supplied by the client and trusted as-is; there is no authentication at
/// this layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub role: Role,
}

impl Identity {
    pub fn new(email: impl Into<String>, role: Role) -> Self {
        Self {
            email: email.into(),
            role,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.email, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_accepts_wire_and_lowercase_spellings() {
        let upper: Role = serde_json::from_str("\"TECHNICIAN\"").unwrap();
        let lower: Role = serde_json::from_str("\"dealer\"").unwrap();
        assert_eq!(upper, Role::Technician);
        assert_eq!(lower, Role::Dealer);
        assert_eq!(serde_json::to_string(&Role::Dealer).unwrap(), "\"DEALER\"");
    }

    #[test]
    fn role_from_str_is_case_insensitive() {
        assert_eq!("Technician".parse::<Role>().unwrap(), Role::Technician);
        assert!("admin".parse::<Role>().is_err());
    }
}
