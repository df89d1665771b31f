use std::sync::Arc;

use flagkit::{AssignmentEvent, ChangeNotification, FileStore, LocalChangeFeed};

pub fn main() -> flagkit::Result<()> {
    env_logger::init();

    let base_url = std::env::var("FLAGKIT_BASE_URL").expect("FLAGKIT_BASE_URL is not set");
    let api_key = std::env::var("FLAGKIT_API_KEY").expect("FLAGKIT_API_KEY is not set");

    let mut config = flagkit::ClientConfig::new(base_url, api_key);
    config
        // Persist cache, assignments and the device id between runs.
        .storage(Arc::new(FileStore::open(std::env::temp_dir().join("flagkit-demo"))?))
        .app_version(env!("CARGO_PKG_VERSION"))
        .assignment_logger(|event: AssignmentEvent| {
            println!("Assigned {} to {}", event.variant_id, event.experiment_id);
        });
    let client = config.to_client()?;

    // Falls back to the cached copy or compiled defaults when the backend is unreachable.
    client.initialize(std::env::var("FLAGKIT_USER_ID").ok().as_deref())?;

    let feed = LocalChangeFeed::new();
    let sync = client.start_sync(&feed)?;

    println!("Identity: {}", client.identity().key());
    println!("daily_challenge: {}", client.is_enabled("daily_challenge", false));
    println!(
        "xp_multiplier: {}",
        client.get_config("content.xp_multiplier", 1.0)
    );
    println!("needs update: {}", client.needs_update());

    if let Some(experiment_id) = std::env::args().nth(1) {
        println!("Variant: {:?}", client.get_variant(&experiment_id));
        client.track_experiment_event(&experiment_id, "demo_opened", None);
    }

    // A realtime transport would forward backend notifications like this.
    feed.publish(&ChangeNotification::new("feature_flags"));

    sync.shutdown()
}
