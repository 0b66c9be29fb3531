use std::error::Error;

use flowdock_sdk::api::Session;
use flowdock_sdk::auth::Credentials;
use flowdock_sdk::events::{Notification, NotificationKind};
use flowdock_sdk::stream::client::StreamOptions;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let email = "REPLACE_WITH_EMAIL".to_string();
    let password = SecretString::new("REPLACE_WITH_PASSWORD".to_string());
    let flows = vec!["REPLACE_WITH_ORG:FLOW_1", "REPLACE_WITH_ORG:FLOW_2"];

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let session = Session::new(Credentials::new(email, password))?;
        session.on(NotificationKind::Error, |notification| {
            if let Notification::Error(error) = notification {
                eprintln!("request failed: {error}");
            }
        });

        let mut options = StreamOptions::new();
        options.insert("active".to_string(), "idle".to_string());
        let stream = session.stream(flows, options)?;
        stream.on(NotificationKind::Connected, |_| println!("connected"));

        let mut notifications = stream.subscribe();
        stream.connect(3).await?;

        while let Some(notification) = notifications.recv().await {
            match notification {
                Notification::Message(message) => {
                    println!("{message}");
                    if message.get("content").and_then(|c| c.as_str()) == Some("!quit") {
                        stream.end().await;
                        break;
                    }
                }
                Notification::Disconnected(reason) | Notification::ClientError(reason) => {
                    eprintln!("stream closed: {reason}");
                    break;
                }
                _ => {}
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
