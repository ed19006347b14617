//! 动作日志管理器
//!
//! 以纯文本、只追加的方式持久化每次分析事件，并提供：
//! - 日志追加（append_log / log_analysis_result / log_api_trigger）
//! - 最近日志读取（read_recent_logs）
//! - 统计、清空与备份（get_stats / clear_logs / backup_logs）
//!
//! 每条记录一行，字段以制表符分隔：`TIME_RANGE\tDESCRIPTION[\tJSON_METADATA]`。
//! 文件头部为三行 `#` 注释加一个空行。多进程并发写入不做协调。

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Local};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::models::{AnalysisLogInfo, AnalysisMode, ApiTriggerInfo, LogStats};

/// 动作日志管理器
pub struct ActionLogManager {
    /// 日志文件路径
    log_file_path: PathBuf,
}

impl ActionLogManager {
    /// 创建日志管理器
    ///
    /// 确保父目录存在；文件不存在时写入固定头部。
    /// 创建失败只记录诊断，构造本身不会失败。
    pub fn new(log_file_path: PathBuf) -> Self {
        let manager = Self { log_file_path };

        if let Some(parent) = manager.log_file_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("日志目录创建失败: {}", e);
            }
        }

        if !manager.log_file_path.exists() {
            if let Err(e) = manager.create_log_file() {
                error!("日志文件创建失败: {}", e);
            }
        }

        manager
    }

    /// 写入日志文件头部（覆盖原有内容）
    fn create_log_file(&self) -> Result<()> {
        let mut content = String::new();
        content.push_str("# Action Log File\n");
        content.push_str("# Format: TIME_RANGE\\tDESCRIPTION\\tBBOX_INFO\n");
        content.push_str(&format!("# Created: {}\n", Local::now().to_rfc3339()));
        content.push('\n');

        fs::write(&self.log_file_path, content)?;
        info!("日志文件已创建: {}", self.log_file_path.display());
        Ok(())
    }

    /// 追加一条日志
    ///
    /// 时间范围格式为 `YYYY-MM-DD-HHMMSS~HHMMSS`，结束时间只保留当天时刻
    /// （假定起止落在同一天，跨天范围为已知限制）。
    ///
    /// # 返回
    /// - `true`: 写入成功
    /// - `false`: 写入失败（诊断已写入日志）
    pub fn append_log(
        &self,
        start_dt: DateTime<Local>,
        end_dt: DateTime<Local>,
        description: &str,
        bbox_info: Option<&Value>,
    ) -> bool {
        match self.try_append(start_dt, end_dt, description, bbox_info) {
            Ok(()) => {
                info!("日志已保存: {}", description);
                true
            }
            Err(e) => {
                error!("日志保存失败: {}", e);
                false
            }
        }
    }

    fn try_append(
        &self,
        start_dt: DateTime<Local>,
        end_dt: DateTime<Local>,
        description: &str,
        bbox_info: Option<&Value>,
    ) -> Result<()> {
        let time_range = format_time_range(start_dt, end_dt);

        // 元数据缺省时不写尾部制表符
        let line = match bbox_info {
            Some(info) => format!(
                "{}\t{}\t{}\n",
                time_range,
                description,
                serde_json::to_string(info)?
            ),
            None => format!("{}\t{}\n", time_range, description),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// 记录一次分析结果
    ///
    /// 起始为当前时间，结束为当前时间加 `duration_sec` 秒。
    pub fn log_analysis_result(
        &self,
        video_path: &Path,
        bbox_normalized: [f64; 4],
        description: &str,
        analysis_mode: AnalysisMode,
        duration_sec: i64,
    ) -> bool {
        let start_dt = Local::now();
        let end_dt = start_dt + Duration::seconds(duration_sec);

        let bbox_info = AnalysisLogInfo {
            bbox_normalized,
            analysis_mode,
            video_path: video_path.to_string_lossy().to_string(),
            duration_sec,
        };

        match serde_json::to_value(&bbox_info) {
            Ok(value) => self.append_log(start_dt, end_dt, description, Some(&value)),
            Err(e) => {
                error!("日志元数据序列化失败: {}", e);
                false
            }
        }
    }

    /// 记录一次外部 API 触发事件（时长固定 1 秒）
    ///
    /// `description` 缺省时使用 `API trigger: {signal_type}`。
    pub fn log_api_trigger(
        &self,
        signal_type: &str,
        bbox_normalized: [f64; 4],
        metadata: Value,
        description: Option<&str>,
    ) -> bool {
        let start_dt = Local::now();
        let end_dt = start_dt + Duration::seconds(1);

        let log_description = match description {
            Some(desc) => desc.to_string(),
            None => format!("API trigger: {}", signal_type),
        };

        let bbox_info = ApiTriggerInfo {
            signal_type: signal_type.to_string(),
            bbox_normalized,
            metadata,
            source: "api_trigger".to_string(),
        };

        match serde_json::to_value(&bbox_info) {
            Ok(value) => self.append_log(start_dt, end_dt, &log_description, Some(&value)),
            Err(e) => {
                error!("日志元数据序列化失败: {}", e);
                false
            }
        }
    }

    /// 读取最近 `count` 条日志（跳过注释与空行，保持原有顺序）
    ///
    /// 文件不存在或读取失败时返回空列表。
    pub fn read_recent_logs(&self, count: usize) -> Vec<String> {
        if !self.log_file_path.exists() {
            return Vec::new();
        }

        let content = match fs::read_to_string(&self.log_file_path) {
            Ok(content) => content,
            Err(e) => {
                error!("日志读取失败: {}", e);
                return Vec::new();
            }
        };

        let log_lines: Vec<String> = content
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_string())
            .collect();

        let skip = log_lines.len().saturating_sub(count);
        log_lines[skip..].to_vec()
    }

    /// 日志统计信息
    ///
    /// 文件不存在时返回全零统计；读取失败时返回 `None` 并记录诊断。
    pub fn get_stats(&self) -> Option<LogStats> {
        if !self.log_file_path.exists() {
            return Some(LogStats {
                total_entries: 0,
                file_size: 0,
                file_path: self.log_file_path.to_string_lossy().to_string(),
                last_modified: None,
            });
        }

        match self.try_stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!("日志统计查询失败: {}", e);
                None
            }
        }
    }

    fn try_stats(&self) -> Result<LogStats> {
        let metadata = fs::metadata(&self.log_file_path)?;
        let content = fs::read_to_string(&self.log_file_path)?;

        let total_entries = content
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
            .count();

        let last_modified = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Local>::from(t).to_rfc3339());

        Ok(LogStats {
            total_entries,
            file_size: metadata.len(),
            file_path: self.log_file_path.to_string_lossy().to_string(),
            last_modified,
        })
    }

    /// 清空日志（重建文件，仅保留头部）
    pub fn clear_logs(&self) -> bool {
        match self.create_log_file() {
            Ok(()) => {
                info!("日志文件已清空");
                true
            }
            Err(e) => {
                error!("日志清空失败: {}", e);
                false
            }
        }
    }

    /// 备份日志文件
    ///
    /// 备份路径为原路径扩展名替换为 `.{suffix}.txt`；`backup_suffix` 缺省时
    /// 使用 `YYYYMMDD_HHMMSS` 时间戳。成功时返回备份路径。
    pub fn backup_logs(&self, backup_suffix: Option<&str>) -> Option<PathBuf> {
        if !self.log_file_path.exists() {
            warn!("没有可备份的日志文件");
            return None;
        }

        let suffix = match backup_suffix {
            Some(s) => s.to_string(),
            None => Local::now().format("%Y%m%d_%H%M%S").to_string(),
        };

        let backup_path = self.log_file_path.with_extension(format!("{}.txt", suffix));

        match fs::copy(&self.log_file_path, &backup_path) {
            Ok(_) => {
                info!("日志备份完成: {}", backup_path.display());
                Some(backup_path)
            }
            Err(e) => {
                error!("日志备份失败: {}", e);
                None
            }
        }
    }

    /// 日志文件路径
    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }
}

/// 格式化时间范围：起始为完整日期时间，结束只保留时刻
fn format_time_range(start_dt: DateTime<Local>, end_dt: DateTime<Local>) -> String {
    format!(
        "{}~{}",
        start_dt.format("%Y-%m-%d-%H%M%S"),
        end_dt.format("%H%M%S")
    )
}
