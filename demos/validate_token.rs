use std::error::Error;

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use twitchify_sdk::helix::HelixClient;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let client_id = "REPLACE_WITH_CLIENT_ID".to_string();
    let access_token = "REPLACE_WITH_USER_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let helix = HelixClient::new(client_id)?;
        let validation = helix
            .validate_token(&SecretString::new(access_token))
            .await?;

        println!(
            "client_id={} login={} user_id={} expires_in={}s",
            validation.client_id,
            validation.login.as_deref().unwrap_or("-"),
            validation.user_id.as_deref().unwrap_or("-"),
            validation.expires_in,
        );
        for scope in &validation.scopes {
            println!("scope {scope}");
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
