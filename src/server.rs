// HTTP server module - viewer page, point-stream and gesture websockets,
// and the JSON control API
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Json, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use crate::controller::ModeController;
use crate::gesture::{
    AdapterStage, CameraFeed, CameraProvider, GestureModel, GestureStatus, Recognizer, VideoFrame,
};
use crate::types::{GestureEvent, Mode};

const GESTURE_CHANNEL_DEPTH: usize = 32;

/// Bridges the gesture websocket into the camera/recognizer seam: the
/// browser does capture and classification, this end replays its event
/// batches as frames. `acquire` hands out the single receiver; `release`
/// puts it back so the adapter can be re-enabled later.
pub struct GestureBridge {
    events_tx: mpsc::Sender<VideoFrame>,
    feed_slot: Mutex<Option<mpsc::Receiver<VideoFrame>>>,
    frame_seq: AtomicU64,
}

impl GestureBridge {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(GESTURE_CHANNEL_DEPTH);
        Arc::new(GestureBridge {
            events_tx: tx,
            feed_slot: Mutex::new(Some(rx)),
            frame_seq: AtomicU64::new(0),
        })
    }

    /// Queue one JSON batch from the websocket. Full channel means the
    /// adapter is behind or disabled; dropping the batch is correct.
    pub fn push_payload(&self, payload: Vec<u8>) {
        let seq = self.frame_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.events_tx.try_send(VideoFrame {
            timestamp_ms: seq,
            data: payload,
        });
    }
}

struct BridgeFeed {
    rx: Option<mpsc::Receiver<VideoFrame>>,
    bridge: Arc<GestureBridge>,
}

#[async_trait]
impl CameraProvider for Arc<GestureBridge> {
    async fn acquire(&self) -> Result<Box<dyn CameraFeed>> {
        let rx = self
            .feed_slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("gesture stream already in use"))?;
        Ok(Box::new(BridgeFeed {
            rx: Some(rx),
            bridge: self.clone(),
        }))
    }
}

#[async_trait]
impl CameraFeed for BridgeFeed {
    async fn next_frame(&mut self) -> Option<VideoFrame> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn release(&mut self) {
        if let Some(rx) = self.rx.take() {
            *self.bridge.feed_slot.lock().unwrap() = Some(rx);
        }
    }
}

/// Recognizer half of the bridge: the payload already is the
/// classification result, so "inference" is a JSON parse.
pub struct BridgeModel;

struct BridgeRecognizer;

#[async_trait]
impl GestureModel for BridgeModel {
    async fn load(&self) -> Result<Box<dyn Recognizer>> {
        Ok(Box::new(BridgeRecognizer))
    }
}

impl Recognizer for BridgeRecognizer {
    fn classify(&mut self, frame: &VideoFrame, _timestamp_ms: u64) -> Result<Vec<GestureEvent>> {
        let events: Vec<GestureEvent> = serde_json::from_slice(&frame.data)?;
        Ok(events)
    }
}

/// Everything the handlers need, shared across connections.
pub struct AppState {
    pub controller: Arc<ModeController>,
    pub frames_tx: broadcast::Sender<Vec<u8>>,
    pub gesture_status: GestureStatus,
    pub bridge: Arc<GestureBridge>,
    pub measured_fps: Arc<Mutex<f64>>,
}

fn stage_str(stage: AdapterStage) -> &'static str {
    match stage {
        AdapterStage::Idle => "idle",
        AdapterStage::ModelLoading => "loading",
        AdapterStage::Ready => "ready",
        AdapterStage::Error => "error",
    }
}

async fn serve_index() -> Html<&'static str> {
    Html(VIEWER_HTML)
}

async fn points_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_points_ws(socket, state))
}

/// Fan one subscriber out of the render thread's broadcast channel. A slow
/// client lags and skips frames rather than stalling the animation.
async fn handle_points_ws(mut socket: WebSocket, state: Arc<AppState>) {
    let mut frames = state.frames_tx.subscribe();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Ok(frame) => {
                        if socket.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn gestures_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_gestures_ws(socket, state))
}

/// Receive classification batches from the browser-side recognizer.
async fn handle_gestures_ws(mut socket: WebSocket, state: Arc<AppState>) {
    while let Some(msg) = socket.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.bridge.push_payload(text.into_bytes());
            }
            Ok(Message::Binary(data)) => {
                state.bridge.push_payload(data);
            }
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

async fn get_mode(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "mode": state.controller.current_mode().as_str(),
        "generation": state.controller.generation(),
        "modes": Mode::all().iter().map(|m| m.as_str()).collect::<Vec<_>>(),
    }))
}

#[derive(serde::Deserialize)]
struct SetModeRequest {
    mode: String,
}

async fn set_mode(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetModeRequest>,
) -> Response {
    let Some(mode) = Mode::from_string(&req.mode) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown mode: {}", req.mode) })),
        )
            .into_response();
    };

    match state.controller.set_mode(mode) {
        Ok(changed) => Json(serde_json::json!({
            "mode": mode.as_str(),
            "changed": changed,
            "generation": state.controller.generation(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "mode": state.controller.current_mode().as_str(),
        "generation": state.controller.generation(),
        "fps": *state.measured_fps.lock().unwrap(),
        "gesture": {
            "stage": stage_str(state.gesture_status.stage()),
            "label": state.gesture_status.label(),
        },
    }))
}

pub async fn run_http_server(ip: String, port: u16, state: Arc<AppState>) -> Result<()> {
    let app = Router::new()
        .route("/", get(serve_index))
        .route("/ws/points", get(points_ws_handler))
        .route("/ws/gestures", get(gestures_ws_handler))
        .route("/api/mode", get(get_mode))
        .route("/api/mode", post(set_mode))
        .route("/api/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", ip, port);
    println!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

const VIEWER_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>morphcloud</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body { background: #05060a; color: #e0e0e0; font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; overflow: hidden; }
        canvas { display: block; }
        #hud { position: fixed; top: 12px; left: 12px; z-index: 10; display: flex; gap: 8px; flex-wrap: wrap; align-items: center; }
        #hud button { background: #1a2333; color: #9fc4ff; border: 1px solid #2c3b55; padding: 6px 14px; border-radius: 4px; cursor: pointer; font-size: 13px; }
        #hud button.active { background: #2b4a7a; color: #fff; }
        #status { position: fixed; bottom: 12px; left: 12px; font-size: 12px; color: #6a7a94; z-index: 10; }
    </style>
</head>
<body>
    <div id="hud"></div>
    <canvas id="view"></canvas>
    <div id="status"></div>
    <script>
        const canvas = document.getElementById('view');
        const ctx = canvas.getContext('2d');
        const hud = document.getElementById('hud');
        const statusEl = document.getElementById('status');
        const MODES = ['tree', 'heart', 'scatter', 'saturn', 'flower', 'dna', 'sphere'];
        let currentMode = '';
        let rotY = 0;

        function resize() {
            canvas.width = window.innerWidth;
            canvas.height = window.innerHeight;
        }
        window.addEventListener('resize', resize);
        resize();

        MODES.forEach(mode => {
            const btn = document.createElement('button');
            btn.textContent = mode;
            btn.id = 'btn-' + mode;
            btn.onclick = () => fetch('/api/mode', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({ mode })
            });
            hud.appendChild(btn);
        });

        function markActive(mode) {
            if (mode === currentMode) return;
            currentMode = mode;
            MODES.forEach(m => {
                document.getElementById('btn-' + m).classList.toggle('active', m === mode);
            });
        }

        // Frame layout: [ver u8][mode u8][groups u8][pad u8][generation u32]
        // then per group [role u8][pad x3][count u32][xyz f32][rgb f32].
        function drawFrame(buf) {
            const dv = new DataView(buf);
            if (dv.getUint8(0) !== 1) return;
            markActive(MODES[dv.getUint8(1)] || '');
            const groups = dv.getUint8(2);
            const cx = canvas.width / 2, cy = canvas.height / 2;
            const scale = Math.min(cx, cy) / 9;
            const cos = Math.cos(rotY), sin = Math.sin(rotY);
            rotY += 0.003;

            ctx.fillStyle = 'rgba(5,6,10,0.45)';
            ctx.fillRect(0, 0, canvas.width, canvas.height);

            let off = 8;
            for (let g = 0; g < groups; g++) {
                const count = dv.getUint32(off + 4, true);
                off += 8;
                const pos = off, col = off + count * 12;
                for (let i = 0; i < count; i++) {
                    const x = dv.getFloat32(pos + i * 12, true);
                    const y = dv.getFloat32(pos + i * 12 + 4, true);
                    const z = dv.getFloat32(pos + i * 12 + 8, true);
                    const rx = x * cos + z * sin;
                    const rz = -x * sin + z * cos;
                    const persp = 24 / (24 + rz);
                    const r = Math.min(255, dv.getFloat32(col + i * 12, true) * 255) | 0;
                    const gr = Math.min(255, dv.getFloat32(col + i * 12 + 4, true) * 255) | 0;
                    const b = Math.min(255, dv.getFloat32(col + i * 12 + 8, true) * 255) | 0;
                    ctx.fillStyle = `rgb(${r},${gr},${b})`;
                    const size = Math.max(1, 2.2 * persp);
                    ctx.fillRect(cx + rx * scale * persp, cy - y * scale * persp, size, size);
                }
                off += count * 24;
            }
        }

        function connectPoints() {
            const ws = new WebSocket(`ws://${location.host}/ws/points`);
            ws.binaryType = 'arraybuffer';
            ws.onmessage = e => drawFrame(e.data);
            ws.onclose = () => setTimeout(connectPoints, 1000);
        }
        connectPoints();

        // Optional: browser-side hand tracking. When a recognizer is
        // running on this page, forward its results as JSON batches:
        //   [{"category":"Open_Palm","confidence":0.9,"hand_index":0}]
        let gestureWs = null;
        function connectGestures() {
            gestureWs = new WebSocket(`ws://${location.host}/ws/gestures`);
            gestureWs.onclose = () => setTimeout(connectGestures, 2000);
        }
        connectGestures();
        window.sendGestures = (events) => {
            if (gestureWs && gestureWs.readyState === WebSocket.OPEN) {
                gestureWs.send(JSON.stringify(events));
            }
        };

        setInterval(async () => {
            try {
                const s = await (await fetch('/api/status')).json();
                statusEl.textContent =
                    `mode ${s.mode} | ${s.fps.toFixed(0)} fps | gesture ${s.gesture.stage}` +
                    (s.gesture.label ? ` (${s.gesture.label})` : '');
            } catch (e) { /* server restarting */ }
        }, 1000);
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bridge_feed_roundtrip() {
        let bridge = GestureBridge::new();
        let events = vec![GestureEvent {
            category: "Open_Palm".to_string(),
            confidence: 0.9,
            hand_index: 0,
            timestamp_ms: 0,
        }];
        bridge.push_payload(serde_json::to_vec(&events).unwrap());

        let mut feed = bridge.acquire().await.unwrap();
        let frame = feed.next_frame().await.unwrap();
        assert_eq!(frame.timestamp_ms, 1);

        let mut recognizer = BridgeModel.load().await.unwrap();
        let parsed = recognizer.classify(&frame, frame.timestamp_ms).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].category, "Open_Palm");
        feed.release();
    }

    #[tokio::test]
    async fn test_bridge_single_consumer_until_release() {
        let bridge = GestureBridge::new();
        let mut feed = bridge.acquire().await.unwrap();
        assert!(bridge.acquire().await.is_err(), "slot must be exclusive");

        feed.release();
        let second = bridge.acquire().await;
        assert!(second.is_ok(), "release must return the slot");
    }

    #[tokio::test]
    async fn test_bridge_recognizer_rejects_garbage() {
        let mut recognizer = BridgeModel.load().await.unwrap();
        let frame = VideoFrame {
            timestamp_ms: 1,
            data: b"not json".to_vec(),
        };
        assert!(recognizer.classify(&frame, 1).is_err());
    }

    #[test]
    fn test_frame_timestamps_strictly_increase() {
        let bridge = GestureBridge::new();
        bridge.push_payload(b"[]".to_vec());
        bridge.push_payload(b"[]".to_vec());
        assert_eq!(bridge.frame_seq.load(Ordering::Relaxed), 2);
    }
}
