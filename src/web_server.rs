use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Local};
use json::JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    common::{Measurement, ServiceContext},
    preview_controller::{frame_stream, PreviewHub, STREAM_CONTENT_TYPE},
};

const PREVIEW_PAGE: &str = include_str!("../assets/index.html");
const MONITOR_PAGE: &str = include_str!("../assets/monitor.html");
const JSON_CONTENT_TYPE: &str = "application/json";

/// Which page `/` serves, and whether the sensor endpoints exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dashboard {
    Preview,
    Monitor,
}

struct WebState {
    ctx: Arc<ServiceContext>,
    hub: Arc<PreviewHub>,
}

pub(crate) fn router(ctx: Arc<ServiceContext>, hub: Arc<PreviewHub>, dashboard: Dashboard) -> Router {
    let state = Arc::new(WebState { ctx, hub });
    let app = Router::new().route("/video_feed", get(video_feed));
    let app = match dashboard {
        Dashboard::Preview => app.route("/", get(|| async { Html(PREVIEW_PAGE) })),
        Dashboard::Monitor => app
            .route("/", get(|| async { Html(MONITOR_PAGE) }))
            .route("/data", get(data))
            .route("/graph-data", get(graph_data)),
    };
    app.with_state(state)
}

/// Serves `app` on `bind` until `cancel` fires.
pub(crate) async fn serve(app: Router, bind: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Web server listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Web server error")?;

    info!("Web server stopped");
    Ok(())
}

/// GET /video_feed: MJPEG stream until the client goes away.
async fn video_feed(State(state): State<Arc<WebState>>) -> Response {
    let rx = state.hub.subscribe();
    debug!(viewers = state.hub.viewer_count(), "Preview viewer connected");
    let body = Body::from_stream(frame_stream(rx, state.ctx.cancel.clone()));
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// GET /data: latest reading, photo count and clock.
async fn data(State(state): State<Arc<WebState>>) -> Response {
    let latest = state.ctx.measurements.latest();
    let photo_count = _photo_count(&state.ctx).await;
    json_response(data_json(latest.as_ref(), photo_count, Local::now()))
}

/// GET /graph-data: Plotly figures for the buffered history.
async fn graph_data(State(state): State<Arc<WebState>>) -> Response {
    let history = state.ctx.measurements.snapshot();
    json_response(graph_json(&history))
}

async fn _photo_count(ctx: &Arc<ServiceContext>) -> usize {
    // Directory scan, keep it off the async workers.
    let ctx = ctx.clone();
    tokio::task::spawn_blocking(move || ctx.photos.photo_count())
        .await
        .unwrap_or(0)
}

fn json_response(value: JsonValue) -> Response {
    ([(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], value.dump()).into_response()
}

pub(crate) fn data_json(
    latest: Option<&Measurement>,
    photo_count: usize,
    now: DateTime<Local>,
) -> JsonValue {
    let reading = latest.cloned().unwrap_or_else(Measurement::sentinel);
    let mut data = JsonValue::new_object();
    data["temperature"] = reading.temperature.into();
    data["humidity"] = reading.humidity.into();
    data["photo_count"] = photo_count.into();
    data["current_time"] = now.format("%H:%M:%S").to_string().into();
    data
}

/// `{"temp_graph": figure, "hum_graph": figure}`, or `{}` with no history.
pub(crate) fn graph_json(history: &[Measurement]) -> JsonValue {
    let mut graphs = JsonValue::new_object();
    if history.is_empty() {
        return graphs;
    }
    let labels: Vec<JsonValue> = history.iter().map(|m| m.clock_label().into()).collect();
    let temperatures: Vec<JsonValue> = history.iter().map(|m| m.temperature.into()).collect();
    let humidities: Vec<JsonValue> = history.iter().map(|m| m.humidity.into()).collect();

    graphs["temp_graph"] = _figure("Temperature", "temperature", labels.clone(), temperatures);
    graphs["hum_graph"] = _figure("Humidity", "humidity", labels, humidities);
    graphs
}

fn _figure(title: &str, series: &str, x: Vec<JsonValue>, y: Vec<JsonValue>) -> JsonValue {
    let mut trace = JsonValue::new_object();
    trace["x"] = JsonValue::Array(x);
    trace["y"] = JsonValue::Array(y);
    trace["type"] = "scatter".into();
    trace["mode"] = "lines".into();
    trace["name"] = series.into();

    let mut layout = JsonValue::new_object();
    layout["title"]["text"] = title.into();
    layout["xaxis"]["title"]["text"] = "timestamp".into();
    layout["yaxis"]["title"]["text"] = series.into();

    let mut figure = JsonValue::new_object();
    figure["data"] = JsonValue::Array(vec![trace]);
    figure["layout"] = layout;
    figure
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::{Request, StatusCode};
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        camera_controller::{
            testing::{test_settings, ScriptedCamera},
            CameraArbiter,
        },
        common::CameraMode,
        preview_controller::{start_preview_controller, FRAME_INTERVAL},
        retry::RetryPolicy,
        timelapse_controller::{PhotoNaming, PhotoStore},
        user_config::Settings,
    };

    fn context() -> (Arc<ServiceContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = CameraArbiter::spawn(
            Box::new(ScriptedCamera::default()),
            test_settings(),
            CameraMode::Preview,
        )
        .unwrap();
        let photos = PhotoStore::open(dir.path(), PhotoNaming::Counter).unwrap();
        let ctx = ServiceContext::new(Settings::default(), arbiter, photos, CancellationToken::new());
        (ctx, dir)
    }

    async fn get_body(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn preview_dashboard_has_no_sensor_routes() {
        let (ctx, _dir) = context();
        let app = router(ctx, PreviewHub::new(4), Dashboard::Preview);

        let (status, page) = get_body(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(page.contains("/video_feed"));

        let (status, _) = get_body(&app, "/data").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn data_defaults_to_zero_without_readings() {
        let (ctx, _dir) = context();
        let app = router(ctx, PreviewHub::new(4), Dashboard::Monitor);

        let (status, body) = get_body(&app, "/data").await;
        assert_eq!(status, StatusCode::OK);
        let data = json::parse(&body).unwrap();
        assert_eq!(data["temperature"].as_f64(), Some(0.0));
        assert_eq!(data["humidity"].as_f64(), Some(0.0));
        assert_eq!(data["photo_count"].as_usize(), Some(0));
        assert_eq!(data["current_time"].as_str().map(str::len), Some(8));
    }

    #[tokio::test]
    async fn data_reports_latest_reading_and_photos() {
        let (ctx, _dir) = context();
        ctx.measurements.push(Measurement::now(19.0, 40.0));
        ctx.measurements.push(Measurement::now(22.5, 48.0));
        ctx.photos.write(&[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        let app = router(ctx, PreviewHub::new(4), Dashboard::Monitor);

        let (_, body) = get_body(&app, "/data").await;
        let data = json::parse(&body).unwrap();
        assert_eq!(data["temperature"].as_f64(), Some(22.5));
        assert_eq!(data["humidity"].as_f64(), Some(48.0));
        assert_eq!(data["photo_count"].as_usize(), Some(1));
    }

    #[tokio::test]
    async fn graph_data_is_empty_object_without_history() {
        let (ctx, _dir) = context();
        let app = router(ctx, PreviewHub::new(4), Dashboard::Monitor);
        let (status, body) = get_body(&app, "/graph-data").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "{}");
    }

    #[test]
    fn graph_json_builds_plotly_figures() {
        let history = vec![
            Measurement {
                timestamp: Local.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
                temperature: 20.0,
                humidity: 40.0,
            },
            Measurement {
                timestamp: Local.with_ymd_and_hms(2024, 5, 1, 10, 0, 2).unwrap(),
                temperature: 21.0,
                humidity: 42.0,
            },
        ];
        let graphs = graph_json(&history);

        let temp = &graphs["temp_graph"];
        assert_eq!(temp["data"][0]["x"][1].as_str(), Some("10:00:02"));
        assert_eq!(temp["data"][0]["y"][0].as_f64(), Some(20.0));
        assert_eq!(temp["data"][0]["mode"].as_str(), Some("lines"));
        assert_eq!(temp["layout"]["title"]["text"].as_str(), Some("Temperature"));

        let hum = &graphs["hum_graph"];
        assert_eq!(hum["data"][0]["y"][1].as_f64(), Some(42.0));
        assert_eq!(hum["layout"]["yaxis"]["title"]["text"].as_str(), Some("humidity"));
    }

    #[tokio::test]
    async fn video_feed_streams_multipart_frames() {
        let (ctx, _dir) = context();
        let hub = PreviewHub::new(4);
        let fast = RetryPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(10),
            jitter: Duration::ZERO,
            max_attempts: u32::MAX,
        };
        let preview = start_preview_controller(ctx.clone(), hub.clone(), FRAME_INTERVAL, fast);
        let app = router(ctx.clone(), hub, Dashboard::Preview);

        let response = app
            .oneshot(Request::builder().uri("/video_feed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        let mut body = response.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(3), body.frame())
            .await
            .expect("no frame within timeout")
            .unwrap()
            .unwrap();
        let part = frame.into_data().unwrap();
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));

        ctx.cancel.cancel();
        assert!(body.frame().await.is_none());
        preview.thread().unpark();
        tokio::task::spawn_blocking(move || preview.join().unwrap())
            .await
            .unwrap();
    }
}
