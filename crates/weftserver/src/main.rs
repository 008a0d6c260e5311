use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use weftcore::{
    ExecutionEvent, ExecutionId, FlowError, NodeId, NodeStatus, Outputs, Workflow, WorkflowError,
};
use weftruntime::{
    validate_workflow, BatchOutcome, BatchReport, ComponentLoader, ComponentRegistry,
    PortAllocator, RunTarget, RunnerRegistry, RuntimeConfig, WeftRuntime,
};

const DEFAULT_INTERPRETER: &str = "python3";

/// Application state shared across handlers
struct AppState {
    runtime: Arc<WeftRuntime>,
    /// Cancellation handles of batches started in the background
    executions: Arc<RwLock<HashMap<ExecutionId, CancellationToken>>>,
    interpreter: PathBuf,
}

/// Request body for running a workflow, e.g.
/// `{"target": {"target": "up_to", "node": "<uuid>"}, "interpreter": "python3"}`
#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    target: RunTarget,
    #[serde(default)]
    interpreter: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: Uuid,
    message: String,
}

#[derive(Debug, Serialize)]
struct ExecutionResponse {
    execution_id: ExecutionId,
    #[serde(flatten)]
    outcome: BatchOutcome,
    completed_nodes: Vec<NodeId>,
    total_nodes: usize,
    duration_ms: u64,
    statuses: HashMap<NodeId, NodeStatus>,
    outputs: HashMap<NodeId, Outputs>,
}

impl ExecutionResponse {
    fn from_report(report: &BatchReport, workflow: &Workflow) -> Self {
        let statuses = workflow
            .nodes
            .iter()
            .map(|node| (node.id, report.status_of(node.id)))
            .collect();
        let outputs = report
            .completed
            .iter()
            .filter_map(|id| report.outputs_of(*id).map(|o| (*id, o.clone())))
            .collect();

        Self {
            execution_id: report.execution_id,
            outcome: report.outcome.clone(),
            completed_nodes: report.completed.clone(),
            total_nodes: workflow.nodes.len(),
            duration_ms: report.duration_ms,
            statuses,
            outputs,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn not_found(what: &str, id: Uuid) -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse {
        error: format!("{} {} not found", what, id),
    })
}

fn error_response(err: &FlowError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    match err {
        FlowError::Workflow(WorkflowError::NotFound(_)) => HttpResponse::NotFound().json(body),
        FlowError::Workflow(_) => HttpResponse::UnprocessableEntity().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "weft"
    }))
}

#[derive(Debug, Serialize)]
struct WorkflowSummary {
    id: Uuid,
    name: String,
    description: Option<String>,
    nodes: usize,
    connections: usize,
    failed: usize,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(w: &Workflow) -> Self {
        Self {
            id: w.id,
            name: w.name.clone(),
            description: w.description.clone(),
            nodes: w.nodes.len(),
            connections: w.connections.len(),
            failed: w
                .nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Failed)
                .count(),
        }
    }
}

#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let mut summaries: Vec<WorkflowSummary> = data
        .runtime
        .list_workflows()
        .await
        .iter()
        .map(WorkflowSummary::from)
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(HttpResponse::Ok().json(summaries))
}

/// Create a new workflow
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<Workflow>,
) -> ActixResult<impl Responder> {
    let workflow = workflow.into_inner();

    if let Err(e) = validate_workflow(&workflow, data.runtime.components()) {
        warn!("Rejected workflow {}: {}", workflow.name, e);
        return Ok(HttpResponse::UnprocessableEntity().json(ErrorResponse {
            error: e.to_string(),
        }));
    }

    info!("Creating workflow: {} ({})", workflow.name, workflow.id);
    let workflow_id = data.runtime.register_workflow(workflow).await;

    Ok(HttpResponse::Created().json(WorkflowResponse {
        id: workflow_id,
        message: "Workflow created successfully".to_string(),
    }))
}

/// Get a specific workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();

    Ok(match data.runtime.get_workflow(workflow_id).await {
        Some(workflow) => HttpResponse::Ok().json(workflow),
        None => not_found("Workflow", workflow_id),
    })
}

/// Delete a workflow
#[actix_web::delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();

    let Some(removed) = data.runtime.remove_workflow(workflow_id).await else {
        return Ok(not_found("Workflow", workflow_id));
    };
    info!("Removed workflow '{}' ({})", removed.name, workflow_id);
    Ok(HttpResponse::NoContent().finish())
}

/// Run a workflow and wait for the batch to finish
#[post("/api/workflows/{id}/run")]
async fn run_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: Option<web::Json<RunRequest>>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let req = req.map(|r| r.into_inner()).unwrap_or_default();
    let interpreter = req.interpreter.unwrap_or_else(|| data.interpreter.clone());

    info!("Running workflow: {}", workflow_id);

    match data
        .runtime
        .execute_workflow(workflow_id, req.target, interpreter)
        .await
    {
        Ok(report) => {
            let workflow = data.runtime.get_workflow(workflow_id).await;
            let total = workflow.as_ref().map(|w| w.nodes.len()).unwrap_or_default();
            info!(
                "Workflow {} finished: {}/{} nodes",
                workflow_id,
                report.completed.len(),
                total
            );
            match workflow {
                Some(workflow) => {
                    Ok(HttpResponse::Ok().json(ExecutionResponse::from_report(&report, &workflow)))
                }
                // deleted while running
                None => Ok(HttpResponse::Gone().json(ErrorResponse {
                    error: format!("Workflow {} was removed during the run", workflow_id),
                })),
            }
        }
        Err(e) => {
            error!("Workflow {} could not run: {}", workflow_id, e);
            Ok(error_response(&e))
        }
    }
}

/// Start a workflow in the background and return its execution id
#[post("/api/workflows/{id}/start")]
async fn start_workflow(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: Option<web::Json<RunRequest>>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let req = req.map(|r| r.into_inner()).unwrap_or_default();
    let interpreter = req.interpreter.unwrap_or_else(|| data.interpreter.clone());

    let handle = match data
        .runtime
        .start_workflow(workflow_id, req.target, interpreter)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!("Workflow {} could not start: {}", workflow_id, e);
            return Ok(error_response(&e));
        }
    };

    let execution_id = handle.execution_id();
    data.executions
        .write()
        .await
        .insert(execution_id, handle.cancellation_token());
    info!("Started execution {} of workflow {}", execution_id, workflow_id);

    let runtime = data.runtime.clone();
    let executions = data.executions.clone();
    tokio::spawn(async move {
        match handle.wait().await {
            Ok(report) => {
                if let Some(mut workflow) = runtime.get_workflow(workflow_id).await {
                    report.state.apply_to(&mut workflow);
                    runtime.register_workflow(workflow).await;
                }
            }
            Err(e) => error!("Execution {} ended abnormally: {}", execution_id, e),
        }
        executions.write().await.remove(&execution_id);
    });

    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "execution_id": execution_id,
        "workflow_id": workflow_id,
    })))
}

/// Cancel a background execution
#[post("/api/executions/{id}/cancel")]
async fn cancel_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let execution_id = path.into_inner();

    match data.executions.read().await.get(&execution_id) {
        Some(token) => {
            token.cancel();
            info!("Cancellation requested for execution {}", execution_id);
            Ok(HttpResponse::Accepted().json(serde_json::json!({
                "message": "Cancellation requested"
            })))
        }
        None => Ok(not_found("Running execution", execution_id)),
    }
}

/// Streams every `ExecutionEvent` as a JSON text frame
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, session, msg_stream) = actix_ws::handle(&req, stream)?;
    let events = data.runtime.subscribe_events();
    info!("Event subscriber connected");
    actix_web::rt::spawn(forward_events(session, msg_stream, events));
    Ok(res)
}

async fn forward_events(
    mut session: actix_ws::Session,
    mut incoming: actix_ws::MessageStream,
    mut events: broadcast::Receiver<ExecutionEvent>,
) {
    loop {
        let wake = tokio::select! {
            event = events.recv() => Feed::Event(event),
            msg = incoming.recv() => Feed::Client(msg),
        };

        let delivered = match wake {
            Feed::Event(Ok(event)) => match serde_json::to_string(&event) {
                Ok(json) => session.text(json).await.is_ok(),
                Err(e) => {
                    warn!("Unserializable event skipped: {}", e);
                    true
                }
            },
            Feed::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!("Event subscriber lagged, {} event(s) dropped", skipped);
                true
            }
            Feed::Event(Err(broadcast::error::RecvError::Closed)) => false,
            Feed::Client(Some(Ok(Message::Ping(bytes)))) => session.pong(&bytes).await.is_ok(),
            Feed::Client(Some(Ok(Message::Close(_)))) | Feed::Client(None) => false,
            Feed::Client(Some(Ok(_))) => true,
            Feed::Client(Some(Err(e))) => {
                warn!("Event subscriber protocol error: {}", e);
                false
            }
        };
        if !delivered {
            break;
        }
    }

    info!("Event subscriber disconnected");
    let _ = session.close(None).await;
}

enum Feed {
    Event(Result<ExecutionEvent, broadcast::error::RecvError>),
    Client(Option<Result<Message, actix_ws::ProtocolError>>),
}

/// List registered components
#[get("/api/components")]
async fn list_components(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let mut components = data.runtime.components().list();
    components.sort_by(|a, b| a.id.cmp(&b.id));

    let components: Vec<_> = components
        .iter()
        .map(|spec| {
            serde_json::json!({
                "id": spec.id,
                "name": spec.name,
                "runtime": spec.runtime,
                "category": spec.category,
                "description": spec.description,
                "inputs": spec.inputs,
                "outputs": spec.outputs,
                "params": spec.params,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(components))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting Weft Server");

    let config = match std::env::var("WEFT_CONFIG") {
        Ok(path) => RuntimeConfig::load(&path)?,
        Err(_) => RuntimeConfig::default(),
    }
    .with_env_overrides();

    let component_dir =
        PathBuf::from(std::env::var("WEFT_COMPONENTS").unwrap_or_else(|_| "components".into()));
    let mut components = ComponentRegistry::new();
    if component_dir.is_dir() {
        ComponentLoader::new(&component_dir).load_into(&mut components)?;
    } else {
        warn!("Component directory {} not found", component_dir.display());
    }

    let mut runners = RunnerRegistry::new();
    weftnodes::register_all(&mut runners, &config);

    // held for the server's lifetime
    let ports = PortAllocator::from_config(&config);
    let (bind_address, _lease) = match std::env::var("BIND_ADDRESS") {
        Ok(address) => (address, None),
        Err(_) => {
            let lease = ports.acquire()?;
            (format!("127.0.0.1:{}", lease.port()), Some(lease))
        }
    };

    let runtime = WeftRuntime::new(components, runners, config);
    info!(
        "✅ Runtime initialized with {} component(s) and runtimes {:?}",
        runtime.components().len(),
        runtime.runners().list_runtimes()
    );

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
        executions: Arc::new(RwLock::new(HashMap::new())),
        interpreter: std::env::var("WEFT_INTERPRETER")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_INTERPRETER)),
    });

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_workflows)
            .service(create_workflow)
            .service(get_workflow)
            .service(delete_workflow)
            .service(run_workflow)
            .service(start_workflow)
            .service(cancel_execution)
            .service(websocket_events)
            .service(list_components)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
