// 视频动作分析器 - DAM 分析与动作日志主库

// 声明模块
pub mod action_log;
pub mod analyzer;
pub mod logger;
pub mod models;

// 重新导出主要类型
pub use action_log::ActionLogManager;
pub use analyzer::DamAnalyzer;
pub use models::{AnalysisLogInfo, AnalysisMode, AnalyzerInfo, ApiTriggerInfo, LogStats};
