//! `blectl`: drive a BLE central session from the command line.
//!
//! Talks to the local BlueZ adapter and prints one JSON object per line.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::json;
use tokio::signal;
use uuid::Uuid;

use ble_central::{
   BleError, BleManager, CharacteristicHandle, Config, Result,
   model::parse_uuid,
   radio::{self, bluez::BluezRadio},
};

#[derive(Parser)]
#[command(name = "blectl")]
#[command(about = "Bluetooth Low Energy central session tool", long_about = None)]
#[command(version)]
struct Cli {
   #[command(subcommand)]
   command: Commands,
}

#[derive(Subcommand)]
enum Commands {
   /// Show the adapter state
   State,
   /// Scan for advertising peripherals
   Scan {
      /// Only report peripherals advertising this service (repeatable)
      #[arg(short, long = "service", value_parser = parse_uuid)]
      services: Vec<Uuid>,
      /// Scan duration in seconds
      #[arg(short, long)]
      duration: Option<f64>,
      #[arg(long)]
      allow_duplicates: bool,
   },
   /// List peripherals the system is already connected to
   Connected {
      #[arg(short, long = "service", value_parser = parse_uuid)]
      services: Vec<Uuid>,
   },
   /// Read a characteristic
   Read {
      id: String,
      service: String,
      characteristic: String,
   },
   /// Write a hex-encoded value to a characteristic
   Write {
      id: String,
      service: String,
      characteristic: String,
      value: String,
      #[arg(long)]
      no_response: bool,
   },
   /// Print characteristic notifications until interrupted
   Monitor {
      id: String,
      service: String,
      characteristic: String,
   },
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let cli = Cli::parse();
   let config = Config::load()?;

   let (radio_tx, radio_rx) = radio::channel(config.channel_capacity);
   let radio = Arc::new(BluezRadio::new(radio_tx).await?);
   let default_scan_secs = config.default_scan_secs;
   let manager = BleManager::new(radio, radio_rx, config);

   match cli.command {
      Commands::State => {
         let state = manager.check_state().await?;
         print_line(&json!({ "adapter": state.to_str() }));
      },
      Commands::Scan {
         services,
         duration,
         allow_duplicates,
      } => {
         manager.on_peripheral_discovered(|peripheral| {
            print_line(&peripheral.to_json());
            Ok(())
         });
         let found = manager
            .scan(
               &services,
               duration.unwrap_or(default_scan_secs),
               allow_duplicates,
            )
            .await?;
         info!("Scan finished, {} peripherals", found.len());
      },
      Commands::Connected { services } => {
         for peripheral in manager.retrieve_connected_peripherals(&services).await? {
            print_line(&peripheral.to_json());
         }
      },
      Commands::Read {
         id,
         service,
         characteristic,
      } => {
         let handle = CharacteristicHandle::parse(id, &service, &characteristic)?;
         let value = with_link(&manager, &handle, async {
            manager.read(&handle).await
         })
         .await?;
         print_line(&json!({
            "handle": handle.to_string(),
            "value": hex::encode(value),
         }));
      },
      Commands::Write {
         id,
         service,
         characteristic,
         value,
         no_response,
      } => {
         let handle = CharacteristicHandle::parse(id, &service, &characteristic)?;
         let data = hex::decode(value.trim_start_matches("0x"))
            .map_err(|e| BleError::InvalidArgument(format!("value is not hex: {e}")))?;
         with_link(&manager, &handle, async {
            manager.write(&handle, &data, !no_response).await
         })
         .await?;
         print_line(&json!({ "handle": handle.to_string(), "written": data.len() }));
      },
      Commands::Monitor {
         id,
         service,
         characteristic,
      } => {
         let handle = CharacteristicHandle::parse(id, &service, &characteristic)?;
         manager.on_characteristic_value_updated(|handle, value| {
            print_line(&json!({
               "handle": handle.to_string(),
               "value": hex::encode(value),
            }));
            Ok(())
         });
         manager.on_peripheral_disconnected(|id, cause| {
            warn!("{id} disconnected ({cause})");
            Ok(())
         });
         with_link(&manager, &handle, async {
            manager.start_notification(&handle).await?;
            signal::ctrl_c().await?;
            info!("Stopping notifications...");
            manager.stop_notification(&handle).await
         })
         .await?;
      },
   }

   Ok(())
}

/// Connects to the handle's peripheral, runs `op`, then disconnects.
async fn with_link<T>(
   manager: &BleManager,
   handle: &CharacteristicHandle,
   op: impl Future<Output = Result<T>>,
) -> Result<T> {
   manager.connect(handle.peripheral.clone()).await?;
   let result = op.await;
   if let Err(e) = manager.disconnect(handle.peripheral.clone()).await {
      warn!("Failed to disconnect {}: {e}", handle.peripheral);
   }
   result
}

fn print_line(value: &serde_json::Value) {
   println!("{value}");
}
