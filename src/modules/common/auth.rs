// Copyright © 2025 relaymail.io
// Licensed under RelayMail License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use serde::{Deserialize, Serialize};

/// Outbound authentication used when calling a tenant's HTTP endpoints
/// (report sink and attachment endpoint).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum OutboundAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

impl OutboundAuth {
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            OutboundAuth::None => builder,
            OutboundAuth::Bearer { token } => builder.bearer_auth(token),
            OutboundAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_deserializes_tagged_variants() {
        let auth: OutboundAuth = serde_json::from_str(r#"{"method":"none"}"#).unwrap();
        assert_eq!(auth, OutboundAuth::None);

        let auth: OutboundAuth =
            serde_json::from_str(r#"{"method":"bearer","token":"t0ken"}"#).unwrap();
        assert_eq!(
            auth,
            OutboundAuth::Bearer {
                token: "t0ken".into()
            }
        );

        let auth: OutboundAuth =
            serde_json::from_str(r#"{"method":"basic","username":"u","password":"p"}"#).unwrap();
        assert_eq!(
            auth,
            OutboundAuth::Basic {
                username: "u".into(),
                password: "p".into()
            }
        );
    }
}
