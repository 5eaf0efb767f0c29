use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde::Serialize;

use blaze_control_lib::codec::{Backup, FileTypes};
use blaze_control_lib::control_interface::{ControlInterface, SequencerMode};
use blaze_control_lib::transport::ConnectionOptions;
use blaze_control_lib::util::discovery::{Discovery, DiscoveryOptions};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "blaze_control",
    about = "Controls networked LED pattern controllers",
    version = "0.1.0"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address of the device
        #[clap(long)]
        ip: String,

        /// Websocket port of the device
        #[clap(long, default_value_t = 81)]
        port: u16,

        /// Response timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,

        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Listens for devices announcing themselves on the network
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,

        /// Answer beacons with time-sync packets while listening
        #[clap(long)]
        time_sync: bool,
    },
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Measures the round-trip time.
    #[clap(name = "ping")]
    Ping,
    /// Prints settings, sequencer state and expander boards.
    #[clap(name = "get-config")]
    GetConfig,
    /// Prints the output expander configuration.
    #[clap(name = "get-expander")]
    GetExpander,
    /// Lists the stored patterns.
    #[clap(name = "list-patterns")]
    ListPatterns,
    /// Activates a pattern by id or name.
    #[clap(name = "set-pattern")]
    SetPattern {
        pattern: String,

        /// Persist the choice across reboots
        #[clap(long)]
        save: bool,
    },
    /// Gets the brightness slider.
    #[clap(name = "get-brightness")]
    GetBrightness,
    /// Sets the brightness slider (0..1).
    #[clap(name = "set-brightness")]
    SetBrightness {
        brightness: f64,

        /// Persist the value across reboots
        #[clap(long)]
        save: bool,
    },
    /// Sets the sequencer mode.
    #[clap(name = "set-sequencer-mode")]
    SetSequencerMode {
        #[clap(value_enum)]
        mode: SequencerMode,
    },
    /// Prints the latest renderer statistics.
    #[clap(name = "statistics")]
    Statistics,
    /// Prints one rendered frame.
    #[clap(name = "preview-frame")]
    PreviewFrame,
    /// Lists the files on the device.
    #[clap(name = "list-files")]
    ListFiles,
    /// Saves every user file into a backup.
    #[clap(name = "save-backup")]
    SaveBackup { file: PathBuf },
    /// Replaces the device files with a backup and reboots.
    #[clap(name = "restore-backup")]
    RestoreBackup { file: PathBuf },
    /// Prints the pixel map.
    #[clap(name = "get-map")]
    GetMap,
}

fn print_output<T: Serialize + std::fmt::Debug>(output: OutputFormat, value: &T) -> Result<()> {
    match output {
        OutputFormat::Plaintext => println!("{:#?}", value),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Discover {
            output,
            timeout,
            time_sync,
        } => {
            let options = DiscoveryOptions::default().with_time_sync(time_sync);
            info!("Listening for beacons for {} ms", timeout);
            let devices =
                Discovery::find_devices_with(options, Duration::from_millis(timeout)).await?;
            match output {
                OutputFormat::Plaintext => {
                    Discovery::pretty_print_devices(&devices);
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string(&devices)?;
                    println!("{}", json);
                }
                OutputFormat::Yaml => {
                    let yaml = serde_yaml::to_string(&devices)?;
                    println!("{}", yaml);
                }
            }
        }
        Commands::DeviceCall {
            ip,
            port,
            timeout,
            output,
            action,
        } => {
            let options = ConnectionOptions::default()
                .with_port(port)
                .with_response_timeout(Duration::from_millis(timeout));
            let control = ControlInterface::with_options(&ip, options).await?;
            info!("Connected to {}:{}", ip, port);

            match action {
                DeviceAction::Ping => {
                    let round_trip = control.ping().await?;
                    println!("Reply from {} in {:?}", ip, round_trip);
                }
                DeviceAction::GetConfig => {
                    let config = control.get_config().await?;
                    print_output(output, &config)?;
                }
                DeviceAction::GetExpander => {
                    let boards = control.get_config_expander().await?;
                    if boards.is_empty() && output == OutputFormat::Plaintext {
                        println!("No output expander configured.");
                    } else {
                        print_output(output, &boards)?;
                    }
                }
                DeviceAction::ListPatterns => {
                    let patterns = control.get_pattern_list(true).await?;
                    match output {
                        OutputFormat::Plaintext => {
                            for (id, name) in patterns {
                                println!("{}  {}", id, name);
                            }
                        }
                        _ => print_output(output, &patterns)?,
                    }
                }
                DeviceAction::SetPattern { pattern, save } => {
                    control.set_active_pattern(&pattern, save).await?;
                    println!("Active pattern set to {}", pattern);
                }
                DeviceAction::GetBrightness => {
                    let brightness = control.get_brightness_slider().await?;
                    println!("Brightness: {}", brightness);
                }
                DeviceAction::SetBrightness { brightness, save } => {
                    control.set_brightness_slider(brightness, save).await?;
                    println!("Brightness set to {}", brightness.clamp(0.0, 1.0));
                }
                DeviceAction::SetSequencerMode { mode } => {
                    control.set_sequencer_mode(mode, false).await?;
                    println!("Sequencer mode set to {}", mode);
                }
                DeviceAction::Statistics => {
                    let statistics = control.get_statistics().await?;
                    print_output(output, &statistics)?;
                }
                DeviceAction::PreviewFrame => {
                    let frame = control.get_preview_frame().await?;
                    control.set_send_preview_frames(false).await?;
                    match output {
                        OutputFormat::Plaintext => {
                            for (index, pixel) in frame.iter().enumerate() {
                                println!(
                                    "{:>5}: #{:02x}{:02x}{:02x}",
                                    index, pixel.red, pixel.green, pixel.blue
                                );
                            }
                        }
                        _ => print_output(output, &frame)?,
                    }
                }
                DeviceAction::ListFiles => {
                    let files = control.get_file_list(FileTypes::all()).await?;
                    match output {
                        OutputFormat::Plaintext => {
                            for file in files {
                                println!("{}", file);
                            }
                        }
                        _ => print_output(output, &files)?,
                    }
                }
                DeviceAction::SaveBackup { file } => {
                    let backup = control.save_backup().await?;
                    backup.to_file(&file)?;
                    println!(
                        "Saved {} files from {} to {}",
                        backup.len(),
                        backup.device_name,
                        file.with_extension("pbb").display()
                    );
                }
                DeviceAction::RestoreBackup { file } => {
                    let backup = Backup::from_file(&file)?;
                    control.restore_backup(&backup).await?;
                    println!("Restored {} files; the device is rebooting.", backup.len());
                }
                DeviceAction::GetMap => match control.get_map_data().await? {
                    Some(map) => print_output(output, &map)?,
                    None => println!("No pixel map stored on the device."),
                },
            }
            control.close().await;
        }
    }

    Ok(())
}
