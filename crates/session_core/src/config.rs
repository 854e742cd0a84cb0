use std::{path::PathBuf, str::FromStr, time::Duration};

/// How pending login handshakes are keyed.
///
/// With `PhoneOnly`, a second `start_login` for the same phone number supersedes
/// the first even when it comes from another user.
/// `UserAndPhone` scopes handshakes per platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeKeyPolicy {
    #[default]
    PhoneOnly,
    UserAndPhone,
}

impl FromStr for HandshakeKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phone_only" | "phone-only" | "phone" => Ok(Self::PhoneOnly),
            "user_and_phone" | "user-and-phone" | "user_phone" => Ok(Self::UserAndPhone),
            other => Err(format!("unknown handshake key policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub sessions_root: PathBuf,
    pub media_root: PathBuf,
    pub public_media_prefix: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub max_concurrent_connections: usize,
    pub max_password_attempts: u32,
    pub handshake_ttl: Duration,
    pub handshake_key_policy: HandshakeKeyPolicy,
    pub online_scan_limit: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            sessions_root: PathBuf::from("./sessions"),
            media_root: PathBuf::from("./media"),
            public_media_prefix: "/media".into(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(120),
            max_concurrent_connections: 4,
            max_password_attempts: 5,
            handshake_ttl: Duration::from_secs(600),
            handshake_key_policy: HandshakeKeyPolicy::PhoneOnly,
            online_scan_limit: 50,
        }
    }
}
