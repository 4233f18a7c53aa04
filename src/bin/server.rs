use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use trim_planner::export;
use trim_planner::optimizer::SearchParams;
use trim_planner::registry::CancellationRegistry;
use trim_planner::scheduler::{GradeScheduler, OrderStore, PlanStore, StoreError};
use trim_planner::store::SqliteStore;
use trim_planner::types::{GradeId, OrderLine, deserialize_u32_from_number};

#[derive(Clone)]
struct AppState {
    store: Arc<SqliteStore>,
    scheduler: GradeScheduler,
    registry: CancellationRegistry,
}

#[derive(Deserialize)]
struct NewGradeRequest {
    name: String,
}

#[derive(Deserialize)]
struct NewOrderRequest {
    grade_id: GradeId,
    orders: Vec<OrderLine>,
}

#[derive(Deserialize)]
struct ProductionUpdateRequest {
    grade_id: GradeId,
    /// Two or three widths combined in the produced cut.
    widths: Vec<u32>,
    #[serde(deserialize_with = "deserialize_u32_from_number")]
    quantity: u32,
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::GradeNotFound(_)
        | StoreError::WidthNotFound { .. }
        | StoreError::InsufficientQuantity { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn add_grade(
    State(state): State<AppState>,
    Json(req): Json<NewGradeRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    if req.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "grade name must be non-empty".into()));
    }
    let store = Arc::clone(&state.store);
    let grade = tokio::task::spawn_blocking(move || store.add_grade(req.name.trim()))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| (store_status(&e), e.to_string()))?;
    Ok((StatusCode::CREATED, Json(json!({ "id": grade }))))
}

async fn new_order(
    State(state): State<AppState>,
    Json(req): Json<NewOrderRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    tracing::info!(grade = req.grade_id, lines = req.orders.len(), "POST /orders");
    if req.orders.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no orders provided".into()));
    }
    if req.orders.iter().any(|o| o.width == 0) {
        return Err((StatusCode::BAD_REQUEST, "order widths must be non-zero".into()));
    }

    // Cancel any in-flight search for this grade before its orders change.
    let grade = req.grade_id;
    state.registry.end(grade);
    state.registry.begin(grade);

    let store = Arc::clone(&state.store);
    let mutated = tokio::task::spawn_blocking(move || {
        store.add_orders(grade, &req.orders)?;
        let details = serde_json::to_string(&req.orders).unwrap_or_default();
        store.log_operation("new_order", grade, &details)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if let Err(err) = mutated {
        state.registry.end(grade);
        return Err((store_status(&err), err.to_string()));
    }

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        if let Err(err) = scheduler.run_one(grade).await {
            tracing::error!(grade, error = %err, "recomputation after new order failed");
        }
    });

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "message": "orders added and recomputation started"
        })),
    ))
}

async fn production_update(
    State(state): State<AppState>,
    Json(req): Json<ProductionUpdateRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    tracing::info!(grade = req.grade_id, widths = ?req.widths, "POST /production");
    if req.widths.len() < 2 || req.widths.len() > 3 {
        return Err((
            StatusCode::BAD_REQUEST,
            "a produced cut combines two or three widths".into(),
        ));
    }
    if req.quantity == 0 {
        return Err((StatusCode::BAD_REQUEST, "quantity must be non-zero".into()));
    }

    let grade = req.grade_id;
    state.registry.end(grade);
    state.registry.begin(grade);

    let store = Arc::clone(&state.store);
    let widths = req.widths.clone();
    let mutated = tokio::task::spawn_blocking(move || {
        store.apply_production(grade, &widths, req.quantity)?;
        let details = serde_json::to_string(&json!({
            "widths": req.widths,
            "quantity": req.quantity,
        }))
        .unwrap_or_default();
        store.log_operation("production_update", grade, &details)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if let Err(err) = mutated {
        state.registry.end(grade);
        return Err((store_status(&err), err.to_string()));
    }

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        if let Err(err) = scheduler.run_one(grade).await {
            tracing::error!(grade, error = %err, "recomputation after production update failed");
        }
    });

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": "production recorded and recomputation started"
        })),
    ))
}

async fn get_orders(
    State(state): State<AppState>,
    Path(grade_id): Path<GradeId>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let store = Arc::clone(&state.store);
    let lines = tokio::task::spawn_blocking(move || store.orders(grade_id))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| (store_status(&e), e.to_string()))?;
    Ok(Json(serde_json::to_value(lines).unwrap_or_default()))
}

async fn get_backlog(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let store = Arc::clone(&state.store);
    let entries = tokio::task::spawn_blocking(move || store.backlog(200))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| (store_status(&e), e.to_string()))?;
    Ok(Json(serde_json::to_value(entries).unwrap_or_default()))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(grade_id): Path<GradeId>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let store = Arc::clone(&state.store);
    let plan = tokio::task::spawn_blocking(move || store.plan(grade_id))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| (store_status(&e), e.to_string()))?;
    match plan {
        Some(stored) => Ok(Json(serde_json::to_value(stored).unwrap_or_default())),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("no plan for grade {grade_id}"),
        )),
    }
}

/// Fixed-interval sweep: cancel everything, recompute every grade, export.
/// `resume` runs before the sweep's own searches so they don't observe the
/// suspend flag and self-cancel.
async fn periodic_sweep(state: AppState, export_dir: PathBuf, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // fires immediately; skip the startup tick
    loop {
        ticker.tick().await;
        tracing::info!("periodic sweep starting");

        state.registry.suspend_all();
        state.registry.resume();

        match state.scheduler.run_all().await {
            Ok(report) => tracing::info!(
                planned = report.planned,
                interrupted = report.interrupted,
                skipped = report.skipped,
                failed = report.failed(),
                "periodic sweep finished"
            ),
            Err(err) => tracing::error!(error = %err, "periodic sweep failed"),
        }

        let store = Arc::clone(&state.store);
        let dir = export_dir.clone();
        let exported = tokio::task::spawn_blocking(move || export::export_csv(&store, &dir)).await;
        match exported {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "snapshot export failed"),
            Err(err) => tracing::error!(error = %err, "snapshot export worker failed"),
        }
    }
}

#[tokio::main]
async fn main() {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("development.log")
        .expect("failed to open development.log");

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_target(false)
        .with_ansi(false)
        .with_max_level(Level::INFO)
        .init();

    let _sentry = std::env::var("SENTRY_DSN").ok().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let db_path = std::env::var("DB_PATH").unwrap_or_else(|_| "trim_planner.db".to_string());
    let store = Arc::new(
        SqliteStore::open(std::path::Path::new(&db_path)).expect("failed to open database"),
    );

    let registry = CancellationRegistry::new();
    let scheduler = GradeScheduler::new(
        Arc::clone(&store) as Arc<dyn OrderStore>,
        Arc::clone(&store) as Arc<dyn PlanStore>,
        registry.clone(),
        SearchParams::default(),
    );
    let state = AppState {
        store,
        scheduler,
        registry,
    };

    let export_dir = PathBuf::from(
        std::env::var("EXPORT_DIR").unwrap_or_else(|_| "data_exports".to_string()),
    );
    let sweep_secs = std::env::var("SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3600u64);
    tokio::spawn(periodic_sweep(
        state.clone(),
        export_dir,
        Duration::from_secs(sweep_secs),
    ));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{port}");

    let app = Router::new()
        .route("/up", get(|| async { "ok" }))
        .route("/grades", post(add_grade))
        .route("/orders", post(new_order))
        .route("/orders/{grade_id}", get(get_orders))
        .route("/production", post(production_update))
        .route("/plans/{grade_id}", get(get_plan))
        .route("/backlog", get(get_backlog))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    eprintln!("Listening on {addr}");
    axum::serve(listener, app).await.unwrap();
}
