use crate::{
    context::{AppContext, ImageSource, Stats},
    errors::MatchError,
    matcher::ProductMatch,
};
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{str::FromStr, sync::Arc};
use tokio::signal;

/// Largest accepted request body (uploads included).
const BODY_LIMIT: usize = 20 * 1024 * 1024;

#[derive(Clone)]
struct SharedState {
    ctx: Arc<AppContext>,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    let static_dir = ctx.config().data_dir().to_path_buf();
    let static_prefix = ctx.config().static_prefix.trim_end_matches('/').to_string();
    let shared_state = Arc::new(SharedState { ctx });

    Router::new()
        .route("/match", post(match_image))
        .route("/api/stats", get(stats))
        .nest_service(&static_prefix, tower_http::services::ServeDir::new(static_dir))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

async fn start_app(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let listen = ctx.config().listen.clone();
    let app = router(ctx);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn start_daemon(ctx: AppContext) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(Arc::new(ctx)).await })
}

#[derive(Debug)]
struct HttpError(MatchError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        if self.0.is_client_error() {
            log::debug!("rejected match request: {}", self.0);
            return (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({"detail": self.0.to_string()})),
            )
                .into_response();
        }

        log::error!("unhandled exception in /match: {:?}", self.0);
        let trace = match &self.0 {
            MatchError::Unexpected(err) => format!("{err:?}"),
            other => format!("{other:?}"),
        };
        (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": self.0.to_string(), "trace": trace})),
        )
            .into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<MatchError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Multipart fields of a `/match` request.
#[derive(Debug, Default)]
struct MatchForm {
    source: Option<ImageSource>,
    image_url: Option<String>,
    top_k: Option<usize>,
    threshold: Option<f32>,
    price_min: Option<f64>,
    price_max: Option<f64>,
}

impl MatchForm {
    async fn read(multipart: &mut Multipart) -> Result<Self, MatchError> {
        let mut form = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| MatchError::InvalidForm(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| MatchError::InvalidForm(e.body_text()))?;
                    form.source = Some(ImageSource::Upload(bytes.to_vec()));
                }
                "image_url" | "top_k" | "threshold" | "price_min" | "price_max" => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| MatchError::InvalidForm(e.body_text()))?;
                    form.set_text(&name, text.trim())?;
                }
                other => log::debug!("ignoring form field {other:?}"),
            }
        }

        Ok(form)
    }

    fn set_text(&mut self, name: &str, value: &str) -> Result<(), MatchError> {
        if value.is_empty() {
            return Ok(());
        }
        match name {
            "image_url" => self.image_url = Some(value.to_string()),
            "top_k" => self.top_k = Some(parse_field(name, value)?),
            "threshold" => self.threshold = Some(parse_field(name, value)?),
            "price_min" => self.price_min = Some(parse_field(name, value)?),
            "price_max" => self.price_max = Some(parse_field(name, value)?),
            _ => {}
        }
        Ok(())
    }

    fn into_source(self) -> Option<ImageSource> {
        self.source.or(self.image_url.map(ImageSource::Url))
    }
}

fn parse_field<T: FromStr>(name: &str, value: &str) -> Result<T, MatchError> {
    value
        .parse()
        .map_err(|_| MatchError::InvalidForm(format!("{name}: {value:?} is not a valid number")))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MatchResponse {
    pub query_matches: Vec<ProductMatch>,
}

async fn match_image(
    State(state): State<Arc<SharedState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<MatchResponse>, HttpError> {
    let form = match multipart {
        Ok(mut multipart) => MatchForm::read(&mut multipart).await?,
        Err(rejection) => {
            log::debug!("no multipart body: {rejection}");
            MatchForm::default()
        }
    };

    log::debug!(
        "match request: top_k={:?} threshold={:?} price_min={:?} price_max={:?}",
        form.top_k,
        form.threshold,
        form.price_min,
        form.price_max
    );

    let ctx = state.ctx.clone();
    let params = ctx.params(form.top_k, form.threshold, form.price_min, form.price_max);
    let bytes = ctx.read_source(form.into_source()).await?;

    let query_matches = tokio::task::spawn_blocking(move || ctx.match_image(&bytes, &params))
        .await
        .map_err(|err| MatchError::Unexpected(anyhow::anyhow!("match task failed: {err}")))??;

    Ok(Json(MatchResponse { query_matches }))
}

async fn stats(State(state): State<Arc<SharedState>>) -> Json<Stats> {
    Json(state.ctx.stats())
}
