pub mod camera;
pub mod commands;
pub mod config;
pub mod device;
pub mod discovery;
pub mod serial;
pub mod transport;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use config::Settings;
use device::{DriverManagement, Notification};

/// Line-oriented front end: one JSON command envelope per stdin line in,
/// one JSON notification per stdout line out. Ends on EOF or Ctrl-C.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let (mut manager, events) = DriverManagement::start(settings).await;
    let printer = tokio::spawn(print_notifications(events, tokio::io::stdout()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                // Rejections are already reported as warnings
                Some(line) => { let _ = manager.handle_message(&line).await; }
                None => {
                    log::info!("Input closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received shutdown signal");
                break;
            }
        }
    }

    manager.shutdown().await;
    drop(manager);
    printer.await?;
    Ok(())
}

async fn print_notifications<W>(mut events: broadcast::Receiver<Notification>, mut out: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let notification = match events.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Output fell behind, {} notifications dropped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let mut line = notification.to_json();
        line.push('\n');
        if let Err(e) = out.write_all(line.as_bytes()).await {
            log::error!("Could not write notification: {}", e);
            break;
        }
        let _ = out.flush().await;
    }
}
