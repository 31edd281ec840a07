use std::error::Error;
use std::sync::Arc;

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use twitchify_sdk::eventsub::{EventPayload, EventRecord, EventSubClient, HandlerError};
use twitchify_sdk::helix::{HelixClient, SubscriptionRequest};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client_id = "REPLACE_WITH_CLIENT_ID".to_string();
    let access_token = "REPLACE_WITH_USER_ACCESS_TOKEN".to_string();
    let broadcaster_id = "REPLACE_WITH_BROADCASTER_USER_ID".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let helix = HelixClient::new(client_id)?;
        let mut client = EventSubClient::new(Arc::new(helix));

        client
            .subscribe(
                SubscriptionRequest::new("channel.follow", "2")
                    .condition("broadcaster_user_id", broadcaster_id.clone())
                    .condition("moderator_user_id", broadcaster_id.clone()),
            )
            .subscribe(
                SubscriptionRequest::new("stream.online", "1")
                    .condition("broadcaster_user_id", broadcaster_id),
            );

        client
            .on_ready(|handle| async move {
                println!("ready session_id={:?}", handle.session_id());
                Ok::<(), HandlerError>(())
            })
            .on("channel.follow", |record: Arc<EventRecord>| async move {
                if let EventPayload::Follow(follow) = &record.payload {
                    println!("new follower {}", follow.user.user_name);
                }
                Ok::<(), HandlerError>(())
            })
            .on("stream.online", |record: Arc<EventRecord>| async move {
                if let EventPayload::StreamOnline(online) = &record.payload {
                    println!("{} went live", online.broadcaster.broadcaster_user_name);
                }
                Ok::<(), HandlerError>(())
            })
            .on("revocation", |record: Arc<EventRecord>| async move {
                println!("subscription {} revoked", record.subscription_id);
                Ok::<(), HandlerError>(())
            })
            .on_error(|err| eprintln!("eventsub error: {err}"));

        let handle = client.handle();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            handle.close();
        });

        client.run(SecretString::new(access_token)).await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
