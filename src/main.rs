use invoice_review_pipeline::api::{self, AppState};
use invoice_review_pipeline::engines::EngineSet;
use invoice_review_pipeline::pipeline::{recover_in_flight, ExtractionEngine, WorkerPool};
use invoice_review_pipeline::service::{Classifier, StaticSupplierDirectory};
use invoice_review_pipeline::storage::FilesystemStore;
use invoice_review_pipeline::{create_pool, migrate, AppConfig, IngestionGateway, ReviewService};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志 - 本地时间格式，RUST_LOG 可覆盖级别
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .with_level(true)
        .init();

    // 加载配置
    let config = AppConfig::from_env()?;
    info!("Starting server with config: {:?}", config);

    // 数据库
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;
    migrate(&pool).await?;
    info!("Database pool created");

    // 文件存储
    tokio::fs::create_dir_all(&config.storage.upload_dir).await?;
    let store = Arc::new(FilesystemStore::new(&config.storage.upload_dir));

    // 抽取引擎 + 分类
    let engines = EngineSet::from_config(&config.pipeline)?;
    let engine = Arc::new(ExtractionEngine::new(engines, &config.pipeline));
    let classifier = Arc::new(Classifier::new(
        config.classifier.clone(),
        Arc::new(StaticSupplierDirectory::new(config.classifier.known_suppliers.clone())),
    ));

    // 后台工作池，并接回上次未完成的发票
    let queue = WorkerPool::start(
        pool.clone(),
        store.clone(),
        engine,
        classifier,
        config.pipeline.tier_concurrency,
    );
    recover_in_flight(&pool, &queue).await?;

    let state = AppState {
        gateway: Arc::new(IngestionGateway::new(pool.clone(), store.clone(), queue.clone())),
        review: Arc::new(ReviewService::new(pool, store, queue)),
        max_upload_bytes: config.storage.max_upload_bytes,
    };
    let app = api::router(state);

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);
    info!("API Endpoints:");
    info!("  POST /api/invoices              - upload");
    info!("  GET  /api/invoices/awaiting     - review queue");
    info!("  POST /api/invoices/:id/approve  - approve");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
