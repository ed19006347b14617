// 数据模型模块 - 定义所有的数据结构

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 分析模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisMode {
    /// bbox 掩码（默认模式，快）
    #[serde(rename = "bbox_based")]
    BboxBased,
    /// SAM2 分割掩码（精确但慢）
    #[serde(rename = "sam2_based")]
    Sam2Based,
}

/// 分析器配置快照
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerInfo {
    /// DAM 脚本路径
    pub dam_script_path: String,
    /// 采样温度
    pub temperature: f64,
    /// 核采样 top_p
    pub top_p: f64,
    /// 指令提示词
    pub prompt: String,
}

/// 分析结果日志的元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisLogInfo {
    /// 归一化 bbox（[0,1] 区间的四个浮点数）
    pub bbox_normalized: [f64; 4],
    /// 分析模式
    pub analysis_mode: AnalysisMode,
    /// 源视频路径
    pub video_path: String,
    /// 事件时长（秒）
    pub duration_sec: i64,
}

/// API 触发日志的元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTriggerInfo {
    /// 信号类型
    pub signal_type: String,
    /// 归一化 bbox
    pub bbox_normalized: [f64; 4],
    /// 调用方附带的元数据
    pub metadata: Value,
    /// 事件来源，固定为 "api_trigger"
    pub source: String,
}

/// 日志统计信息
#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    /// 日志条目数（不含注释与空行）
    pub total_entries: usize,
    /// 文件大小（字节）
    pub file_size: u64,
    /// 日志文件路径
    pub file_path: String,
    /// 最后修改时间（RFC 3339）
    pub last_modified: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_mode_serde_tags() {
        assert_eq!(
            serde_json::to_string(&AnalysisMode::BboxBased).unwrap(),
            "\"bbox_based\""
        );
        assert_eq!(
            serde_json::to_string(&AnalysisMode::Sam2Based).unwrap(),
            "\"sam2_based\""
        );
    }

    #[test]
    fn test_analysis_log_info_field_order() {
        let info = AnalysisLogInfo {
            bbox_normalized: [0.1, 0.2, 0.5, 0.6],
            analysis_mode: AnalysisMode::BboxBased,
            video_path: "clip.mp4".to_string(),
            duration_sec: 5,
        };

        let json = serde_json::to_string(&info).unwrap();
        // 序列化结果为单行，字段顺序与结构体声明一致
        assert!(!json.contains('\n'));
        let bbox_pos = json.find("bbox_normalized").unwrap();
        let mode_pos = json.find("analysis_mode").unwrap();
        assert!(bbox_pos < mode_pos);
    }
}
