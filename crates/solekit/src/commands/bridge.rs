//! Bridge command handlers: scan, watch, firmware.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tabled::Tabled;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use solekit_core::{BridgeClient, BridgeEvent, CoreError, DeviceEvent};
use solekit_proto::bridge::DiscoveredDevice;
use solekit_proto::image::ImageInfo;

use crate::cli::{BridgeArgs, BridgeCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::files;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct DiscoveredRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    device_type: String,
    #[tabled(rename = "RSSI")]
    rssi: i16,
}

impl From<&DiscoveredDevice> for DiscoveredRow {
    fn from(d: &DiscoveredDevice) -> Self {
        Self {
            id: d.bluetooth_id.clone(),
            name: d.name.clone(),
            device_type: d.device_type.to_string(),
            rssi: d.rssi,
        }
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

pub async fn handle(args: BridgeArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = super::load_config(global)?;
    let config = cfg.bridge_config(args.url.as_deref())?;

    // Validate the image before touching the bridge.
    let image = match args.command {
        BridgeCommand::Firmware { ref image, .. } => Some(files::read_image(image)?),
        _ => None,
    };

    info!(url = %config.url, "connecting to bridge");
    let client = BridgeClient::connect(config);
    let result = match within(global.timeout, "the bridge", client.wait_until_connected()).await {
        Ok(()) => match args.command {
            BridgeCommand::Scan { duration } => scan(&client, duration, global).await,
            BridgeCommand::Watch { device_id } => watch(&client, &device_id, global).await,
            BridgeCommand::Firmware { device_id, .. } => match image {
                Some((data, info)) => firmware(&client, &device_id, data, &info, global).await,
                None => Ok(()),
            },
        },
        Err(e) => Err(e),
    };
    client.shutdown();
    result
}

/// Bound a core operation by `--timeout`.
async fn within<T>(
    seconds: u64,
    what: &str,
    fut: impl Future<Output = Result<T, CoreError>>,
) -> Result<T, CliError> {
    tokio::time::timeout(Duration::from_secs(seconds), fut)
        .await
        .map_err(|_| CliError::Timeout {
            what: what.into(),
            seconds,
        })?
        .map_err(CliError::from)
}

fn spinner(message: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    bar.set_message(message.to_owned());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

// ── Scan ────────────────────────────────────────────────────────────

async fn scan(client: &BridgeClient, duration: u64, global: &GlobalOpts) -> Result<(), CliError> {
    let mut events = client.subscribe();
    within(global.timeout, "scanning to become available", async {
        loop {
            if client.is_scanning_available() {
                return Ok(());
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(CoreError::Bridge {
                        message: "bridge client stopped".into(),
                    });
                }
            }
        }
    })
    .await?;

    if !client.is_scanning() {
        client.start_scan().await?;
    }

    let bar = spinner("Scanning...", global.quiet);
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(BridgeEvent::DiscoveredDevice(_) | BridgeEvent::ExpiredDiscoveredDevice(_)) => {
                    bar.set_message(format!("Scanning... {} found", client.discovered_devices().len()));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }
    bar.finish_and_clear();

    let devices = client.discovered_devices();
    if client.is_scanning() {
        if let Err(e) = client.stop_scan().await {
            warn!(error = %e, "failed to stop scanning");
        }
    }

    let out = output::render_list(&global.output, &devices, |d| DiscoveredRow::from(d), |d| {
        d.bluetooth_id.clone()
    })?;
    output::print_output(&out, global.quiet);
    Ok(())
}

// ── Watch ───────────────────────────────────────────────────────────

async fn watch(client: &BridgeClient, device_id: &str, global: &GlobalOpts) -> Result<(), CliError> {
    let device = client.device(device_id);
    let mut events = device.events();
    within(global.timeout, "the device", client.connect_to_device(device_id)).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = events.next() => match event {
                Some(event) => output::print_output(&serde_json::to_string(&event)?, global.quiet),
                None => break,
            }
        }
    }

    if let Err(e) = client.disconnect_from_device(device_id).await {
        warn!(error = %e, device = device_id, "failed to disconnect");
    }
    Ok(())
}

// ── Firmware ────────────────────────────────────────────────────────

/// Upload progress as a position on a 0..=1000 bar.
#[allow(clippy::as_conversions, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn permille(progress: f64) -> u64 {
    (progress.clamp(0.0, 1.0) * 1000.0).round() as u64
}

fn upload_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(1000);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {percent}% {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

async fn firmware(
    client: &BridgeClient,
    device_id: &str,
    data: Vec<u8>,
    info: &ImageInfo,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    info!(version = %info.version, size = info.image_size, "firmware image validated");

    let device = client.device(device_id);
    let mut ready = device.watch_ready();
    within(global.timeout, "the device", client.connect_to_device(device_id)).await?;
    within(global.timeout, "the device handshake", async {
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| CoreError::Disconnected)
    })
    .await?;

    let bar = upload_bar(global.quiet);
    bar.set_message(format!("v{}", info.version));
    let progress = {
        let bar = bar.clone();
        let mut events = device.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::FirmwareUploadProgress(p)) => bar.set_position(permille(p)),
                    Ok(DeviceEvent::FirmwareUploadComplete) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        })
    };

    let result = device.firmware().upload(Bytes::from(data)).await;
    progress.abort();

    match result {
        Ok(()) => {
            bar.set_position(1000);
            bar.finish_with_message(format!("v{} uploaded", info.version));
            output::print_output(
                &format!("Uploaded {} to {device_id}; run test/confirm to boot it", info.version),
                global.quiet,
            );
            Ok(())
        }
        Err(e) => {
            bar.abandon_with_message("upload failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_maps_onto_the_bar() {
        assert_eq!(permille(0.0), 0);
        assert_eq!(permille(0.4567), 457);
        assert_eq!(permille(1.0), 1000);
        assert_eq!(permille(1.5), 1000);
    }
}
