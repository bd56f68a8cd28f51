// morphcloud - animated 3D point cloud that morphs between named shapes,
// driven by keyboard, HTTP API, or browser-side hand gestures
use anyhow::Result;
use clap::Parser;
use crossterm::event::{poll, read, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use notify::{Config as NotifyConfig, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Alignment;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::Terminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::broadcast;

mod config;
mod controller;
mod gesture;
mod particles;
mod renderer;
mod server;
mod shapes;
mod types;

use config::{Args, CloudConfig};
use controller::{GroupSpec, ModeController};
use gesture::{AdapterStage, GestureAdapter, GestureRules};
use renderer::{Renderer, SharedRenderState};
use server::{AppState, BridgeModel, GestureBridge};
use shapes::{ShapeParams, TreeStyle};
use types::{GroupRole, Mode};

fn group_specs(config: &CloudConfig) -> Vec<GroupSpec> {
    vec![
        GroupSpec {
            role: GroupRole::Main,
            count: config.main_count,
            damping: config.main_damping,
        },
        GroupSpec {
            role: GroupRole::Ribbon,
            count: config.ribbon_count,
            damping: config.ribbon_damping,
        },
        GroupSpec {
            role: GroupRole::Ambient,
            count: config.ambient_count,
            damping: config.ambient_damping,
        },
    ]
}

fn shape_params(config: &CloudConfig) -> ShapeParams {
    let tree_style = TreeStyle::from_string(&config.tree_style).unwrap_or_else(|| {
        eprintln!("Unknown tree_style '{}', using glyph", config.tree_style);
        TreeStyle::Glyph
    });
    ShapeParams {
        tree_style,
        glyph_text: config.glyph_text.clone(),
        heart_outline: config.heart_outline,
    }
}

fn gesture_rules(config: &CloudConfig) -> GestureRules {
    GestureRules {
        single_confidence: config.gesture_single_confidence,
        combo_confidence: config.gesture_combo_confidence,
        ..GestureRules::default()
    }
}

fn spawn_http_server(
    config: &CloudConfig,
    state: Arc<AppState>,
) -> Option<thread::JoinHandle<()>> {
    if !config.httpd_enabled {
        return None;
    }

    let ip = config.httpd_ip.clone();
    let port = config.httpd_port;

    let handle = thread::spawn(move || {
        let rt = match tokio::runtime::Runtime::new() {
            Ok(rt) => rt,
            Err(e) => {
                eprintln!("Failed to create HTTP runtime: {}", e);
                return;
            }
        };
        rt.block_on(async {
            if let Err(e) = server::run_http_server(ip, port, state).await {
                eprintln!("HTTP server error: {}", e);
            }
        });
    });

    Some(handle)
}

/// Watch the config file and signal when it changes on disk
fn spawn_config_watcher(config_change_tx: broadcast::Sender<()>) -> Result<()> {
    let config_path = CloudConfig::config_path(None)?;

    std::thread::spawn(move || -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = match RecommendedWatcher::new(tx, NotifyConfig::default()) {
            Ok(w) => w,
            Err(_) => return Ok(()),
        };

        if watcher
            .watch(&config_path, RecursiveMode::NonRecursive)
            .is_err()
        {
            return Ok(());
        }

        loop {
            match rx.recv() {
                Ok(Ok(NotifyEvent { kind, .. })) => {
                    if matches!(kind, notify::EventKind::Modify(_)) {
                        let _ = config_change_tx.send(());
                    }
                }
                Err(_) => break,
                _ => {}
            }
        }
        Ok(())
    });

    Ok(())
}

/// Apply the hot-reloadable subset of the config: fps, dampings, and the
/// mode itself. Counts and the HTTP listener need a restart.
fn apply_runtime_config(
    config: &CloudConfig,
    controller: &ModeController,
    shared_state: &Arc<Mutex<SharedRenderState>>,
) {
    {
        let mut state = shared_state.lock().unwrap();
        state.fps = config.fps;
        state.generation += 1;
    }

    {
        let engine = controller.engine();
        let mut engine = engine.lock().unwrap();
        for group in engine.groups_mut() {
            let damping = match group.role() {
                GroupRole::Main => config.main_damping,
                GroupRole::Ribbon => config.ribbon_damping,
                GroupRole::Ambient => config.ambient_damping,
            };
            group.set_damping(damping);
        }
    }

    if let Some(mode) = Mode::from_string(&config.mode) {
        if let Err(e) = controller.set_mode(mode) {
            eprintln!("Config mode change failed: {}", e);
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set global config path immediately (before any config loads)
    CloudConfig::set_config_path(args.cfg.clone());

    let cfg_arg = args.cfg.as_deref();
    let config_path = CloudConfig::config_path(cfg_arg)?;
    let config_file_exists = config_path.exists();

    let mut config = if config_file_exists {
        match CloudConfig::load_with_path(cfg_arg) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                eprintln!("Config file: {}", config_path.display());
                eprintln!("Fix the config file or delete it to regenerate with defaults.");
                return Err(e);
            }
        }
    } else {
        let mut default_config = CloudConfig::default();
        default_config.config_path = Some(config_path.clone());
        default_config
    };

    let args_provided = config.merge_with_args(&args);
    config.sanitize();
    if !config_file_exists || args_provided {
        config.save()?;
    }

    println!("Using config file: {}", config_path.display());

    let initial_mode = Mode::from_string(&config.mode)
        .ok_or_else(|| anyhow::anyhow!("Unknown mode in config: {}", config.mode))?;

    let controller = Arc::new(ModeController::bootstrap(
        initial_mode,
        &group_specs(&config),
        shape_params(&config),
    )?);

    // Runtime kept alive for the whole session; the gesture adapter spawns
    // its inference task onto it.
    let rt = tokio::runtime::Runtime::new()?;
    let _rt_guard = rt.enter();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let (frames_tx, _) = broadcast::channel(8);
    let shared_state = Arc::new(Mutex::new(SharedRenderState::new(config.fps)));

    let renderer = Renderer::new(
        controller.clone(),
        frames_tx.clone(),
        shared_state.clone(),
        shutdown.clone(),
    );
    let measured_fps = renderer.measured_fps_handle();
    let render_handle = renderer::spawn_render_thread(renderer);

    let bridge = GestureBridge::new();
    let mut adapter = GestureAdapter::new(
        controller.clone(),
        gesture_rules(&config),
        Duration::from_millis(config.gesture_min_interval_ms),
    );
    if config.gesture_enabled {
        adapter.enable(Arc::new(bridge.clone()), Arc::new(BridgeModel));
    }

    let app_state = Arc::new(AppState {
        controller: controller.clone(),
        frames_tx: frames_tx.clone(),
        gesture_status: adapter.status(),
        bridge: bridge.clone(),
        measured_fps: measured_fps.clone(),
    });
    let _http_handle = spawn_http_server(&config, app_state);

    let (config_change_tx, config_change_rx) = broadcast::channel(16);
    spawn_config_watcher(config_change_tx)?;

    if args.quiet {
        run_headless(
            &controller,
            &shared_state,
            &shutdown,
            config_change_rx,
        );
    } else if let Err(e) = run_tui(
        &controller,
        &shared_state,
        &shutdown,
        &measured_fps,
        &mut adapter,
        &bridge,
        config_change_rx,
    ) {
        eprintln!("TUI error: {}", e);
    }

    // Orderly teardown: stop gesture inference, then the render thread.
    shutdown.store(true, Ordering::SeqCst);
    adapter.disable();
    rt.block_on(adapter.join());
    let _ = render_handle.join();

    println!("Goodbye.");
    Ok(())
}

fn run_headless(
    controller: &Arc<ModeController>,
    shared_state: &Arc<Mutex<SharedRenderState>>,
    shutdown: &Arc<AtomicBool>,
    mut config_change_rx: broadcast::Receiver<()>,
) {
    while !shutdown.load(Ordering::Relaxed) {
        if config_change_rx.try_recv().is_ok() {
            if let Ok(updated) = CloudConfig::load() {
                apply_runtime_config(&updated, controller, shared_state);
            }
        }
        thread::sleep(Duration::from_millis(200));
    }
}

fn run_tui(
    controller: &Arc<ModeController>,
    shared_state: &Arc<Mutex<SharedRenderState>>,
    shutdown: &Arc<AtomicBool>,
    measured_fps: &Arc<Mutex<f64>>,
    adapter: &mut GestureAdapter,
    bridge: &Arc<GestureBridge>,
    mut config_change_rx: broadcast::Receiver<()>,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = (|| -> Result<()> {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            if config_change_rx.try_recv().is_ok() {
                if let Ok(updated) = CloudConfig::load() {
                    apply_runtime_config(&updated, controller, shared_state);
                }
            }

            if poll(Duration::from_millis(100))? {
                if let Event::Key(key) = read()? {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => break,
                        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                            break
                        }
                        KeyCode::Char('n') | KeyCode::Char('N') => {
                            let next = controller.current_mode().next();
                            if let Err(e) = controller.set_mode(next) {
                                eprintln!("Mode change failed: {}", e);
                            }
                        }
                        KeyCode::Char('g') | KeyCode::Char('G') => {
                            if adapter.is_enabled() {
                                adapter.disable();
                            } else {
                                adapter.enable(Arc::new(bridge.clone()), Arc::new(BridgeModel));
                            }
                        }
                        KeyCode::Char(c) => {
                            if let Some(mode) = Mode::from_digit(c) {
                                if let Err(e) = controller.set_mode(mode) {
                                    eprintln!("Mode change failed: {}", e);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }

            let mode = controller.current_mode();
            let generation = controller.generation();
            let fps = *measured_fps.lock().unwrap();
            let status = adapter.status();
            let stage = status.stage();
            let label = status.label();

            terminal.draw(|f| {
                let stage_text = match stage {
                    AdapterStage::Idle => ("idle", Color::DarkGray),
                    AdapterStage::ModelLoading => ("loading", Color::Yellow),
                    AdapterStage::Ready => ("ready", Color::Green),
                    AdapterStage::Error => ("error", Color::Red),
                };

                let mut mode_spans = vec![Span::styled(
                    "Mode: ",
                    Style::default().fg(Color::DarkGray),
                )];
                for (i, m) in Mode::all().iter().enumerate() {
                    let style = if *m == mode {
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
                    } else {
                        Style::default().fg(Color::Gray)
                    };
                    mode_spans.push(Span::styled(format!("[{}] {}  ", i + 1, m), style));
                }

                let lines = vec![
                    Line::from(mode_spans),
                    Line::from(vec![
                        Span::styled("Render: ", Style::default().fg(Color::DarkGray)),
                        Span::raw(format!("{:.0} fps  switches: {}", fps, generation)),
                    ]),
                    Line::from(vec![
                        Span::styled("Gesture: ", Style::default().fg(Color::DarkGray)),
                        Span::styled(stage_text.0, Style::default().fg(stage_text.1)),
                        Span::raw(match &label {
                            Some(l) => format!("  ({})", l),
                            None => String::new(),
                        }),
                    ]),
                    Line::from(Span::styled(
                        "1-7 mode | n next | g gesture on/off | q quit",
                        Style::default().fg(Color::DarkGray),
                    )),
                ];

                let pane = Paragraph::new(lines)
                    .alignment(Alignment::Left)
                    .block(Block::default().borders(Borders::ALL).title(" morphcloud "));
                f.render_widget(pane, f.size());
            })?;
        }
        Ok(())
    })();

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}
