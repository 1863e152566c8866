use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 原始文件存放目录
    pub upload_dir: String,
    pub max_upload_bytes: usize,
}

/// 抽取流水线参数 (阈值全部可配置)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 同时进行的抽取任务数
    pub tier_concurrency: usize,
    pub text_layer_min_chars: usize,
    pub text_layer_max_replacement_chars: usize,
    /// 第 2 层平均置信度下限 (百分制)
    pub ocr_min_mean_confidence: f64,
    pub ocr_max_low_confidence_ratio: f64,
    pub ocr_min_text_chars: usize,
    /// 第 2 层与损坏文本层交叉核对数字的最低命中率
    pub number_match_min_ratio: f64,
    pub text_layer_timeout_secs: u64,
    pub general_ocr_timeout_secs: u64,
    pub heavy_ocr_timeout_secs: u64,
    pub field_extraction_timeout_secs: u64,
    pub text_layer_command: Option<String>,
    pub general_ocr_command: Option<String>,
    pub heavy_ocr_command: Option<String>,
    pub field_extraction_command: Option<String>,
}

impl PipelineConfig {
    pub fn text_layer_timeout(&self) -> Duration {
        Duration::from_secs(self.text_layer_timeout_secs)
    }

    pub fn general_ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.general_ocr_timeout_secs)
    }

    pub fn heavy_ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.heavy_ocr_timeout_secs)
    }

    pub fn field_extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.field_extraction_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tier_concurrency: 2,
            text_layer_min_chars: 100,
            text_layer_max_replacement_chars: 20,
            ocr_min_mean_confidence: 80.0,
            ocr_max_low_confidence_ratio: 0.10,
            ocr_min_text_chars: 50,
            number_match_min_ratio: 0.5,
            text_layer_timeout_secs: 30,
            general_ocr_timeout_secs: 120,
            heavy_ocr_timeout_secs: 300,
            field_extraction_timeout_secs: 120,
            text_layer_command: None,
            general_ocr_command: None,
            heavy_ocr_command: None,
            field_extraction_command: None,
        }
    }
}

/// 供应商主数据 (外部系统导入)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownSupplier {
    pub name: String,
    pub gst_number: Option<String>,
}

/// 异常分类参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// 金额核对容差: 相对合计金额的比例
    pub amount_tolerance_ratio: f64,
    /// 金额核对容差: 绝对值下限 (舍入误差)
    pub amount_tolerance_abs: f64,
    pub scan_quality_min_confidence: f64,
    pub scan_quality_max_low_ratio: f64,
    /// 供应商名称模糊匹配阈值 (Jaro-Winkler)
    pub supplier_match_threshold: f64,
    /// 空列表在默认值层里会被 config 丢掉，缺失时按空处理
    #[serde(default)]
    pub known_suppliers: Vec<KnownSupplier>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_ratio: 0.01,
            amount_tolerance_abs: 0.005,
            scan_quality_min_confidence: 85.0,
            scan_quality_max_low_ratio: 0.08,
            supplier_match_threshold: 0.88,
            known_suppliers: Vec::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://invoices.db".to_string(),
                max_connections: 5,
            },
            storage: StorageConfig {
                upload_dir: "uploads".to_string(),
                max_upload_bytes: 20 * 1024 * 1024,
            },
            pipeline: PipelineConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl AppConfig {
    /// 分层加载: 默认值 → 配置文件 (可选) → INVOICE__* 环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("INVOICE_PIPELINE_CONFIG")
            .unwrap_or_else(|_| "invoice-pipeline.toml".to_string());

        Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("INVOICE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// 加载配置后再叠加传统的环境变量 (SERVER_HOST / SERVER_PORT / DATABASE_URL)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::load()?;
        if let Ok(host) = std::env::var("SERVER_HOST") {
            config.server.host = host;
        }
        if let Some(port) = std::env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()) {
            config.server.port = port;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        Ok(config)
    }
}
