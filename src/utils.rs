use crate::peer::types::{ServerConfig, ServerKind};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Prefix the ICE server URL with its scheme when the user left it out.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    const SCHEMES: [&str; 3] = ["stun:", "turn:", "turns:"];
    if SCHEMES.iter().any(|scheme| config.url.starts_with(scheme)) {
        config.url.clone()
    } else {
        let scheme = match config.r#type {
            ServerKind::Turn => "turn:",
            ServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}
