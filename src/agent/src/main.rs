use actix_web::{get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder};
use controller_core::telemetry;
use prometheus::{Encoder, TextEncoder};
use rescheduler::{ReschedulerConfig, State};
use tokio::sync::watch;
use tracing::error;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await?;
    let config = ReschedulerConfig::load(std::env::var("RESCHEDULER_CONFIG").ok().as_deref().map(std::path::Path::new))?;

    // Initialize the control loop state
    let state = State::default();
    let (shutdown, signal) = watch::channel(false);
    let controller = {
        let state = state.clone();
        async move {
            let result = rescheduler::run(state, config, signal).await;
            if let Err(e) = &result {
                error!("Rescheduler exited: {}", e);
            }
            result
        }
    };

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .disable_signals()
    .run();
    let server_handle = server.handle();

    // SIGINT and SIGTERM stop the loop, and the loop stops the server
    rescheduler::stop_on(rescheduler::shutdown_signal(), shutdown);

    let (controller_result, server_result) = tokio::join!(
        async {
            let result = controller.await;
            server_handle.stop(true).await;
            result
        },
        server
    );
    server_result?;
    controller_result?;
    Ok(())
}
