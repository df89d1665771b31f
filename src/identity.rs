//! Stable per-installation identity.
use std::sync::{Arc, OnceLock};

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::storage::{KeyValueStore, DEVICE_ID_KEY};

/// Who is being evaluated. The bucketing key is the user id when authenticated, otherwise the
/// device id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Option<String>,
    pub device_id: String,
}

impl Identity {
    pub fn new(user_id: Option<String>, device_id: impl Into<String>) -> Identity {
        Identity {
            user_id: user_id.filter(|id| !id.is_empty()),
            device_id: device_id.into(),
        }
    }

    /// The string fed to bucketing and used to key assignments.
    pub fn key(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.device_id)
    }
}

/// Produces the device id, generating and persisting it on first use. Once persisted, the id is
/// never regenerated.
pub struct IdentityProvider {
    storage: Arc<dyn KeyValueStore>,
    platform: String,
    device_id: OnceLock<String>,
}

impl IdentityProvider {
    pub fn new(storage: Arc<dyn KeyValueStore>, platform: impl Into<String>) -> IdentityProvider {
        IdentityProvider {
            storage,
            platform: platform.into(),
            device_id: OnceLock::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        self.device_id.get_or_init(|| self.load_or_create())
    }

    fn load_or_create(&self) -> String {
        match self.storage.get(DEVICE_ID_KEY) {
            Ok(Some(stored)) => {
                // Stored as a JSON string; accept a bare value written by other tooling.
                let device_id = serde_json::from_str::<String>(&stored).unwrap_or(stored);
                if !device_id.is_empty() {
                    return device_id;
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!(target: "flagkit", "failed to read device id, generating a new one: {:?}", err);
            }
        }

        let device_id = generate_device_id(&self.platform);
        log::debug!(target: "flagkit", device_id = device_id.as_str(); "generated device id");
        let persisted = serde_json::to_string(&device_id)
            .map_err(crate::Error::from)
            .and_then(|json| self.storage.set(DEVICE_ID_KEY, &json));
        if let Err(err) = persisted {
            // Still stable for the lifetime of this process.
            log::warn!(target: "flagkit", "failed to persist device id: {:?}", err);
        }
        device_id
    }
}

/// `<platform>-<unix millis>-<9 random base36 chars>`.
pub fn generate_device_id(platform: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .filter(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        .take(9)
        .map(char::from)
        .collect();
    format!("{platform}-{millis}-{random}")
}
