use anyhow::{anyhow, Result};
use eframe::egui;
use log::info;
use std::sync::Arc;

mod camera_controller;
mod capture_request;
mod chart_detector;
mod config;
mod coordinator;
mod frame;
mod overlay;
mod scheduler;
mod sensor_modes;
mod session;
mod startup;
mod texture;
mod tuning;
mod ui;
mod validator;
mod worker_pool;

use crate::camera_controller::{FrameSource, RpicamFrameSource, StreamConfig};
use crate::chart_detector::{ChartLocator, CommandChartDetector, RetryPolicy};
use crate::config::Config;
use crate::scheduler::DetectionScheduler;
use crate::sensor_modes::{list_cameras, select_sensor_mode};
use crate::startup::default_session_dir;
use crate::tuning::CttTuningInvoker;
use crate::ui::{Collaborators, TuningApp};
use crate::validator::{BrightnessFloor, CommandImageInspector, StrictValidator};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting camera tuning capture");

    // Load configuration
    let config = Config::load()?;
    info!(
        "Configuration loaded: {}x{} preview, {} detection workers",
        config.display.preview_width, config.display.preview_height, config.detection.workers
    );

    // No camera means nothing to do
    let listing = list_cameras(&config.camera.list_command)?;
    let sensor_mode = select_sensor_mode(&listing.modes);
    info!("Camera model: {}", listing.model);
    match &sensor_mode {
        Some(mode) => info!("Sensor mode: {}", mode.rpicam_arg()),
        None => log::warn!("No sensor mode with an origin crop; using the camera default"),
    }

    let home = dirs::home_dir().ok_or_else(|| anyhow!("Could not determine the home directory"))?;
    let default_dir = default_session_dir(&home, &listing.model);

    let mut source = RpicamFrameSource::new(&config.camera)?;
    source.configure(StreamConfig {
        preview_size: config.preview_size(),
        sensor_mode,
    })?;

    let detector = CommandChartDetector::new(&config.detection.command, config.paths.scratch_dir.clone())?;
    let locator = Arc::new(ChartLocator::new(
        Arc::new(detector),
        RetryPolicy::from(&config.detection),
    ));
    let scheduler = DetectionScheduler::new(
        locator,
        config.detection.workers,
        config.detection.miss_hysteresis,
        config.overlay_size(),
    )?;

    let inspector = CommandImageInspector::new(&config.validation.command)?;
    let validator = StrictValidator::new(
        Box::new(inspector),
        BrightnessFloor {
            margin: config.validation.darkness_margin,
        },
    );
    let tuner = CttTuningInvoker::new(config.tuning.python.clone(), &config.tuning.ctt_dir);

    let collaborators = Collaborators {
        source: Box::new(source),
        scheduler,
        validator: Arc::new(validator),
        tuner: Arc::new(tuner),
        profiles: config.tuning.profiles.clone(),
        runtime: tokio::runtime::Handle::current(),
    };

    let window_size = [
        config.display.window_width as f32,
        config.display.window_height as f32,
    ];
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size(window_size)
            .with_min_inner_size(window_size)
            .with_title("Camera Tuning Capture"),
        ..Default::default()
    };

    info!("Launching GUI application...");

    eframe::run_native(
        "Camera Tuning Capture",
        options,
        Box::new(move |cc| {
            setup_style(&cc.egui_ctx);
            Box::new(TuningApp::new(config, listing.model, default_dir, collaborators))
        }),
    )
    .map_err(|e| anyhow!("Failed to run application: {}", e))?;

    info!("Application shut down gracefully");
    Ok(())
}

fn setup_style(ctx: &egui::Context) {
    let mut style = (*ctx.style()).clone();

    style.spacing.button_padding = egui::vec2(12.0, 8.0);
    style.spacing.item_spacing = egui::vec2(10.0, 8.0);

    style.text_styles.insert(
        egui::TextStyle::Button,
        egui::FontId::new(16.0, egui::FontFamily::Proportional),
    );
    style.text_styles.insert(
        egui::TextStyle::Body,
        egui::FontId::new(15.0, egui::FontFamily::Proportional),
    );
    style.text_styles.insert(
        egui::TextStyle::Heading,
        egui::FontId::new(22.0, egui::FontFamily::Proportional),
    );

    ctx.set_style(style);
}
