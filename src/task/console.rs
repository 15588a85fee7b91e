//! Serial console task
//!
//! Reads command lines from UART0, executes them through the contactor
//! command channel and the flash storage task, and writes the replies.
//! Characters are echoed; backspace edits the line.

use core::fmt::Write;

use defmt::{info, warn};
use embassy_rp::uart::{Config, Uart};
use ev_bms::console::{self, Command, HELP};
use ev_bms::settings::{ContactorSettings, SettingsError};
use heapless::String;

use crate::system::{
    event::{self, ContactorCommand},
    resources::{ConsoleResources, Irqs},
    state::SYSTEM_STATE,
};
use crate::task::flash_storage::{FlashCommand, send_flash_command};

/// Longest accepted command line
const LINE_LEN: usize = 32;

/// Largest reply (status dumps)
const REPLY_LEN: usize = 512;

const PROMPT: &str = "> ";

#[embassy_executor::task]
pub async fn console(r: ConsoleResources) {
    let mut uart = Uart::new(r.uart, r.tx_pin, r.rx_pin, Irqs, r.tx_dma, r.rx_dma, Config::default());
    let mut line: String<LINE_LEN> = String::new();
    let mut reply: String<REPLY_LEN> = String::new();
    info!("Console started");

    let _ = uart.write(b"\r\nEV BMS console, h for help\r\n").await;
    let _ = uart.write(PROMPT.as_bytes()).await;

    let mut byte = [0u8; 1];
    loop {
        if let Err(e) = uart.read(&mut byte).await {
            warn!("Console read error: {}", e);
            continue;
        }

        match byte[0] {
            b'\r' | b'\n' => {
                let _ = uart.write(b"\r\n").await;
                if !line.trim().is_empty() {
                    reply.clear();
                    if execute(&line, &mut reply).await.is_err() {
                        reply.clear();
                        let _ = reply.push_str("reply too long\n");
                    }
                    // terminals want \r\n
                    for (i, part) in reply.split('\n').enumerate() {
                        if i > 0 {
                            let _ = uart.write(b"\r\n").await;
                        }
                        let _ = uart.write(part.as_bytes()).await;
                    }
                }
                line.clear();
                let _ = uart.write(PROMPT.as_bytes()).await;
            }
            // backspace / delete
            0x08 | 0x7f => {
                if line.pop().is_some() {
                    let _ = uart.write(b"\x08 \x08").await;
                }
            }
            c if c.is_ascii_graphic() || c == b' ' => {
                if line.push(char::from(c)).is_ok() {
                    let _ = uart.write(&byte).await;
                }
            }
            _ => {}
        }
    }
}

/// Runs one command line and renders its reply
async fn execute(line: &str, out: &mut String<REPLY_LEN>) -> core::fmt::Result {
    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(e) => return writeln!(out, "Error: {}", e),
    };
    info!("Console command: {}", command);

    match command {
        Command::Close => {
            event::send_command(ContactorCommand::Close).await;
            writeln!(out, "Closing contactors")
        }
        Command::Open => {
            event::send_command(ContactorCommand::Open).await;
            writeln!(out, "Opening contactors")
        }
        Command::FeedbackBypass(disabled) => {
            event::send_command(ContactorCommand::FeedbackBypass(disabled)).await;
            writeln!(out, "Feedback bypass {} requested", if disabled { "on" } else { "off" })
        }
        Command::ContactorStatus => match SYSTEM_STATE.lock().await.contactors {
            Some(status) => console::write_contactor_status(out, &status),
            None => writeln!(out, "Contactors not initialised"),
        },
        Command::ChargeStatus => match SYSTEM_STATE.lock().await.charge {
            Some(status) => console::write_charge_status(out, &status),
            None => writeln!(out, "Charge estimator not running yet"),
        },
        Command::ShuntStatus => match SYSTEM_STATE.lock().await.shunt {
            Some(shunt) => console::write_shunt_status(out, shunt.state, shunt.dtc, &shunt.reading),
            None => writeln!(out, "Current sensor not running yet"),
        },
        Command::ResetShunt => {
            event::SHUNT_RESET.signal(());
            writeln!(out, "Resetting current sensor")
        }
        Command::Strategy(kind) => {
            let settings = current_settings().await.with_strategy(kind);
            apply(out, Ok(settings)).await
        }
        Command::Tolerance(volts) => {
            let settings = current_settings().await.with_tolerance(volts);
            apply(out, settings).await
        }
        Command::Timeout(ms) => {
            let settings = current_settings().await.with_timeout(ms);
            apply(out, settings).await
        }
        Command::Save => {
            let settings = current_settings().await;
            send_flash_command(FlashCommand::SaveContactorSettings(settings)).await;
            writeln!(out, "Saving contactor settings")
        }
        Command::Erase => {
            send_flash_command(FlashCommand::EraseAll).await;
            writeln!(out, "Erasing stored settings and charge seed")
        }
        Command::Help => out.write_str(HELP),
    }
}

/// Settings in effect in the contactor task
async fn current_settings() -> ContactorSettings {
    SYSTEM_STATE
        .lock()
        .await
        .contactors
        .map(|status| status.settings)
        .unwrap_or_default()
}

async fn apply(out: &mut String<REPLY_LEN>, settings: Result<ContactorSettings, SettingsError>) -> core::fmt::Result {
    match settings {
        Ok(settings) => {
            event::send_command(ContactorCommand::ApplySettings(settings)).await;
            writeln!(
                out,
                "Strategy {}, tolerance {:.1}V, timeout {}ms (w to save)",
                settings.strategy.as_str(),
                settings.voltage_match_tolerance,
                settings.voltage_match_timeout_ms
            )
        }
        Err(e) => writeln!(out, "Error: {}", e),
    }
}
