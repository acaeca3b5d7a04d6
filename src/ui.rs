use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use eframe::egui;
use tokio::runtime::Handle;

use crate::camera_controller::FrameSource;
use crate::capture_request::{CaptureCategory, CaptureRequest};
use crate::config::Config;
use crate::coordinator::{CaptureCoordinator, Notice};
use crate::scheduler::DetectionScheduler;
use crate::session::{CaptureError, CaptureSession};
use crate::startup::{create_session_dir, resolve_session_dir};
use crate::texture::{OverlayTexture, PreviewTexture};
use crate::tuning::{HardwareProfile, TuningInvoker};
use crate::validator::StrictValidator;

// ============================================================================
// CONSTANTS FOR UI STYLING
// ============================================================================
const UI_PADDING: f32 = 20.0;
const STATUS_SECONDS: u64 = 3;
const POLL_INTERVAL: Duration = Duration::from_millis(15);

// ============================================================================
// ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    ChooseDirectory,
    Capture,
    Tuning,
    Done,
}

/// Everything the coordinator needs except the session directory, which
/// the user picks first.
pub struct Collaborators {
    pub source: Box<dyn FrameSource>,
    pub scheduler: DetectionScheduler,
    pub validator: Arc<StrictValidator>,
    pub tuner: Arc<dyn TuningInvoker>,
    pub profiles: Vec<HardwareProfile>,
    pub runtime: Handle,
}

// ============================================================================
// MAIN APP STRUCT
// ============================================================================

pub struct TuningApp {
    pub current_phase: Phase,
    config: Config,

    // Directory chooser
    camera_model: String,
    default_dir: PathBuf,
    dir_input: String,

    // Capture
    collaborators: Option<Collaborators>,
    coordinator: Option<CaptureCoordinator>,
    preview: PreviewTexture,
    overlay: Option<OverlayTexture>,
    tab: CaptureCategory,
    macbeth_temperature: String,
    macbeth_lux: String,
    shading_temperature: String,

    // Dialogs
    confirm_overwrite: Option<CaptureRequest>,
    error_message: Option<String>,
    status_message: Option<(String, Instant)>,
    tuning_outcome: Option<Notice>,
}

// ============================================================================
// INITIALIZATION
// ============================================================================

impl TuningApp {
    pub fn new(config: Config, camera_model: String, default_dir: PathBuf, collaborators: Collaborators) -> Self {
        Self {
            current_phase: Phase::ChooseDirectory,
            config,
            camera_model,
            default_dir,
            dir_input: String::new(),
            collaborators: Some(collaborators),
            coordinator: None,
            preview: PreviewTexture::new(),
            overlay: None,
            tab: CaptureCategory::Macbeth,
            macbeth_temperature: String::new(),
            macbeth_lux: String::new(),
            shading_temperature: String::new(),
            confirm_overwrite: None,
            error_message: None,
            status_message: None,
            tuning_outcome: None,
        }
    }

    fn start_session(&mut self, ctx: &egui::Context, directory: PathBuf) {
        if let Err(e) = create_session_dir(&directory) {
            self.error_message = Some(format!("{:#}", e));
            return;
        }
        let Some(parts) = self.collaborators.take() else { return };

        let mut coordinator = CaptureCoordinator::new(
            parts.source,
            parts.scheduler,
            CaptureSession::new(directory),
            parts.validator,
            parts.tuner,
            parts.profiles,
            parts.runtime,
        );
        if let Err(e) = coordinator.start() {
            log::error!("Failed to start camera: {:#}", e);
            self.error_message = Some(format!("Failed to start camera: {:#}", e));
            return;
        }

        self.coordinator = Some(coordinator);
        self.overlay = Some(OverlayTexture::new(ctx));
        self.current_phase = Phase::Capture;
    }
}

// ============================================================================
// MAIN UPDATE LOOP
// ============================================================================

impl eframe::App for TuningApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if ctx.input(|i| i.key_pressed(egui::Key::Escape)) && self.current_phase != Phase::Tuning {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        self.poll_coordinator(ctx);

        match self.current_phase {
            Phase::ChooseDirectory => self.render_directory_chooser(ctx),
            Phase::Capture => self.render_capture(ctx),
            Phase::Tuning => self.render_tuning(ctx),
            Phase::Done => self.render_done(ctx),
        }

        self.render_dialogs(ctx);

        if self.coordinator.is_some() {
            ctx.request_repaint_after(POLL_INTERVAL);
        }
    }
}

impl TuningApp {
    fn poll_coordinator(&mut self, ctx: &egui::Context) {
        let (Some(coordinator), Some(overlay)) = (self.coordinator.as_mut(), self.overlay.as_mut()) else {
            return;
        };

        if coordinator.tick(overlay) {
            if let Some(frame) = coordinator.latest_frame() {
                self.preview.update(ctx, frame.image());
            }
        }

        for notice in coordinator.take_notices() {
            match notice {
                Notice::CaptureAccepted(record) => {
                    self.status_message = Some((format!("Saved {}", record.label()), Instant::now()));
                }
                Notice::CaptureRejected(rejection) => {
                    self.error_message = Some(rejection.to_string());
                }
                Notice::CaptureFailed(reason) => {
                    self.error_message = Some(reason);
                }
                outcome @ (Notice::TuningFinished(_) | Notice::TuningFailed(_)) => {
                    self.tuning_outcome = Some(outcome);
                    self.current_phase = Phase::Done;
                    overlay.detach();
                }
            }
        }
    }

    fn run_capture(&mut self, request: CaptureRequest, overwrite_confirmed: bool) {
        let Some(coordinator) = self.coordinator.as_mut() else { return };
        match coordinator.request_capture(request, overwrite_confirmed) {
            Ok(()) => {}
            Err(CaptureError::OverwriteUnconfirmed(_)) => self.confirm_overwrite = Some(request),
            Err(e) => self.error_message = Some(e.to_string()),
        }
    }

    fn finish(&mut self) {
        let Some(coordinator) = self.coordinator.as_mut() else { return };
        match coordinator.finish() {
            Ok(()) => self.current_phase = Phase::Tuning,
            Err(e) => self.error_message = Some(e.to_string()),
        }
    }
}

// ============================================================================
// DIRECTORY CHOOSER
// ============================================================================

impl TuningApp {
    fn render_directory_chooser(&mut self, ctx: &egui::Context) {
        let mut chosen = None;

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.add_space(UI_PADDING);
            ui.heading(format!("Camera: {}", self.camera_model));
            ui.add_space(UI_PADDING);
            ui.label("Directory for the calibration images:");

            ui.horizontal(|ui| {
                let default_hint = self.default_dir.display().to_string();
                ui.add(
                    egui::TextEdit::singleline(&mut self.dir_input)
                        .hint_text(default_hint)
                        .desired_width(500.0),
                );

                if ui.button("Browse…").clicked() {
                    let mut dialog = rfd::FileDialog::new().set_file_name(&self.camera_model);
                    if let Some(parent) = self.default_dir.parent() {
                        dialog = dialog.set_directory(parent);
                    }
                    if let Some(path) = dialog.save_file() {
                        self.dir_input = path.display().to_string();
                    }
                }
            });

            let resolved = resolve_session_dir(&self.dir_input, &self.default_dir);
            match &resolved {
                Ok(path) => {
                    ui.label(format!("Images will be saved to {}", path.display()));
                }
                Err(e) => {
                    ui.colored_label(egui::Color32::from_rgb(200, 60, 60), format!("Invalid directory: {}", e));
                }
            }

            ui.add_space(UI_PADDING);
            if ui.add_enabled(resolved.is_ok(), egui::Button::new("Next")).clicked() {
                chosen = resolved.ok();
            }
        });

        if let Some(directory) = chosen {
            self.start_session(ctx, directory);
        }
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

impl TuningApp {
    fn render_capture(&mut self, ctx: &egui::Context) {
        let controls_width = self
            .config
            .display
            .window_width
            .saturating_sub(self.config.display.preview_width) as f32;

        egui::SidePanel::right("capture_controls")
            .exact_width(controls_width.max(300.0))
            .resizable(false)
            .show(ctx, |ui| {
                self.render_controls(ui);
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(egui::Color32::from_rgb(40, 40, 40)))
            .show(ctx, |ui| {
                self.render_preview(ui);
            });
    }

    fn render_preview(&mut self, ui: &mut egui::Ui) {
        let rect = ui.max_rect();
        let Some(texture) = self.preview.handle() else {
            ui.centered_and_justified(|ui| {
                ui.label("Waiting for camera…");
            });
            return;
        };

        let display_size = fit_image_in_rect(texture.size_vec2(), rect.size());
        let image_rect = center_rect_in_rect(display_size, rect);
        let uv = egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0));

        let painter = ui.painter();
        painter.image(texture.id(), image_rect, uv, egui::Color32::WHITE);
        // the overlay is in display space, stretched over the preview
        if let Some(overlay) = self.overlay.as_ref().and_then(|o| o.handle()) {
            painter.image(overlay.id(), image_rect, uv, egui::Color32::WHITE);
        }
    }

    fn render_controls(&mut self, ui: &mut egui::Ui) {
        let Some(coordinator) = self.coordinator.as_ref() else { return };
        let session = coordinator.session();
        let idle = session.is_idle();
        let can_finish = session.can_finish();

        ui.add_space(UI_PADDING);
        ui.horizontal(|ui| {
            for category in CaptureCategory::all() {
                ui.selectable_value(&mut self.tab, *category, category.name());
            }
        });
        ui.separator();

        let mut request = None;
        match self.tab {
            CaptureCategory::Macbeth => {
                ui.horizontal(|ui| {
                    ui.label("Temperature (K):");
                    ui.text_edit_singleline(&mut self.macbeth_temperature);
                });
                ui.horizontal(|ui| {
                    ui.label("Lux:");
                    ui.text_edit_singleline(&mut self.macbeth_lux);
                });
                let parsed = CaptureRequest::macbeth(&self.macbeth_temperature, &self.macbeth_lux).ok();
                if ui
                    .add_enabled(idle && parsed.is_some(), egui::Button::new("Capture Macbeth"))
                    .clicked()
                {
                    request = parsed;
                }
            }
            CaptureCategory::LensShading => {
                ui.horizontal(|ui| {
                    ui.label("Temperature (K):");
                    ui.text_edit_singleline(&mut self.shading_temperature);
                });
                let parsed = CaptureRequest::lens_shading(&self.shading_temperature).ok();
                if ui
                    .add_enabled(idle && parsed.is_some(), egui::Button::new("Capture lens shading"))
                    .clicked()
                {
                    request = parsed;
                }
            }
            CaptureCategory::ChromaticAberration => {
                if ui.add_enabled(idle, egui::Button::new("Capture CAC")).clicked() {
                    request = Some(CaptureRequest::ChromaticAberration);
                }
            }
        }

        ui.add_space(8.0);
        if session.is_validating() {
            ui.label("Wait while detecting chart");
        } else if session.is_camera_busy() {
            ui.label("Capturing…");
        } else if self.tab == CaptureCategory::Macbeth && coordinator.chart_visible() {
            ui.colored_label(egui::Color32::from_rgb(0, 200, 0), "Chart detected");
        }

        ui.separator();
        egui::ScrollArea::vertical()
            .max_height((ui.available_height() - 80.0).max(60.0))
            .show(ui, |ui| {
                for record in session.ledger().records(self.tab) {
                    ui.label(record.label());
                }
            });

        if let Some((message, shown_at)) = &self.status_message {
            if shown_at.elapsed().as_secs() < STATUS_SECONDS {
                ui.label(message.as_str());
            }
        }

        let finish_clicked = ui.add_enabled(can_finish, egui::Button::new("Done")).clicked();

        if let Some(request) = request {
            let needs_confirmation = session.needs_overwrite_confirmation(&request);
            if needs_confirmation {
                self.confirm_overwrite = Some(request);
            } else {
                self.run_capture(request, false);
            }
        }
        if finish_clicked {
            self.finish();
        }
    }
}

// ============================================================================
// TUNING AND DIALOGS
// ============================================================================

impl TuningApp {
    fn render_tuning(&mut self, ctx: &egui::Context) {
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.centered_and_justified(|ui| {
                ui.horizontal(|ui| {
                    ui.spinner();
                    ui.heading("Running ctt");
                });
            });
        });
    }

    fn render_done(&mut self, ctx: &egui::Context) {
        let mut close = false;

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.add_space(UI_PADDING);
            match &self.tuning_outcome {
                Some(Notice::TuningFinished(files)) => {
                    ui.heading("Calibration files written:");
                    for file in files {
                        ui.label(file.display().to_string());
                    }
                }
                Some(Notice::TuningFailed(reason)) => {
                    ui.heading("Tuning failed");
                    ui.label(reason.as_str());
                }
                _ => {}
            }
            ui.add_space(UI_PADDING);
            close = ui.button("Close").clicked();
        });

        if close {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }
    }

    fn render_dialogs(&mut self, ctx: &egui::Context) {
        if let Some(request) = self.confirm_overwrite {
            let mut answer = None;
            egui::Window::new("Overwrite image?")
                .collapsible(false)
                .resizable(false)
                .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
                .show(ctx, |ui| {
                    if let CaptureRequest::Macbeth { temperature, .. } = request {
                        ui.label(format!(
                            "A Macbeth image at {}K already exists. Replace it?",
                            temperature
                        ));
                    }
                    ui.horizontal(|ui| {
                        if ui.button("Replace").clicked() {
                            answer = Some(true);
                        }
                        if ui.button("Cancel").clicked() {
                            answer = Some(false);
                        }
                    });
                });

            if let Some(replace) = answer {
                self.confirm_overwrite = None;
                if replace {
                    self.run_capture(request, true);
                }
            }
        }

        if let Some(message) = self.error_message.clone() {
            let mut dismissed = false;
            egui::Window::new("Error")
                .collapsible(false)
                .resizable(false)
                .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
                .show(ctx, |ui| {
                    ui.label(message);
                    dismissed = ui.button("OK").clicked();
                });
            if dismissed {
                self.error_message = None;
            }
        }
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn fit_image_in_rect(image_size: egui::Vec2, container_size: egui::Vec2) -> egui::Vec2 {
    let scale = (container_size.x / image_size.x).min(container_size.y / image_size.y);
    image_size * scale
}

fn center_rect_in_rect(content_size: egui::Vec2, container: egui::Rect) -> egui::Rect {
    let offset = (container.size() - content_size) * 0.5;
    egui::Rect::from_min_size(container.min + offset, content_size)
}
