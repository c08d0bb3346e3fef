// src/main.rs
//
// Entry point: loads the configuration and the marker template, spawns the
// detect loop on its own thread and drives it from a small stdin command
// prompt.

mod calibrate;
mod capture;
mod config;
mod debug;
mod engine;
mod input;
mod tracker;
mod types;
mod vision;

use anyhow::{ensure, Context, Result};
use engine::{DetectLoop, LoopParams};
use opencv::imgcodecs;
use opencv::prelude::*;
use std::io::{self, BufRead};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use types::Config;

fn main() -> Result<()> {
    let config = Config::load("config.yaml").context("loading config.yaml")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let template = imgcodecs::imread(&config.template.path, imgcodecs::IMREAD_GRAYSCALE)
        .with_context(|| format!("reading marker template {}", config.template.path))?;
    ensure!(
        !template.empty(),
        "marker template {} is empty or unreadable",
        config.template.path
    );

    let mut params = LoopParams::from_config(&config);
    let engine = DetectLoop::new(template, params.clone());
    let control = engine.control();
    let handle = engine.spawn().context("spawning detect thread")?;
    info!("commands: start | pause | resume | debug on | debug off | stop | quit");

    for line in io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "start" => {
                control.start();
            }
            "pause" => {
                control.pause();
            }
            "resume" => {
                control.resume();
            }
            "debug on" => {
                params.save_debug = true;
                control.set_parameters(params.clone());
                info!("frame dumps enabled from the next session");
            }
            "debug off" => {
                params.save_debug = false;
                control.set_parameters(params.clone());
                info!("frame dumps disabled from the next session");
            }
            "stop" | "quit" => break,
            "" => {}
            other => warn!(command = other, "unknown command"),
        }
    }

    control.stop();
    if handle.join().is_err() {
        warn!("detect thread panicked");
    }
    Ok(())
}
