//! DAM 分析器
//!
//! 调用外部 DAM（Describe Anything Model）脚本，对视频中指定区域的主体
//! 生成一句动作描述：
//! - bbox 掩码分析（analyze_with_bbox，默认模式，快）
//! - SAM2 分割掩码分析（analyze_with_sam2，精确但慢）

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use regex::Regex;
use tracing::{debug, error, info};

use crate::models::AnalyzerInfo;

/// 默认采样温度
const DEFAULT_TEMPERATURE: f64 = 0.1;
/// 默认核采样 top_p
const DEFAULT_TOP_P: f64 = 0.15;

/// 默认指令提示词：只描述主体的动作或状态变化，不描述外观
const DEFAULT_PROMPT: &str = "Video: <image><image><image><image><image><image><image><image>\n\
    Return **one concise English sentence** that describes ONLY the subject's action or state change. \
    Do NOT mention appearance, colour, clothing, background, objects, or physical attributes.";

/// DAM 输出中的描述行标记
const DESCRIPTION_MARKER: &str = "Description:";

/// DAM 分析器
pub struct DamAnalyzer {
    /// DAM 脚本路径
    dam_script_path: PathBuf,
    /// 采样温度
    temperature: f64,
    /// 核采样 top_p
    top_p: f64,
    /// 指令提示词
    prompt: String,
}

impl DamAnalyzer {
    /// 创建分析器
    ///
    /// # 参数
    /// - `dam_script_path`: DAM 脚本路径，不存在时返回错误
    pub fn new(dam_script_path: PathBuf) -> Result<Self> {
        // DAM 脚本存在性检查
        if !dam_script_path.exists() {
            return Err(anyhow!(
                "DAM script not found at: {}",
                dam_script_path.display()
            ));
        }

        Ok(Self {
            dam_script_path,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            prompt: DEFAULT_PROMPT.to_string(),
        })
    }

    /// 视频分析（统一入口）
    ///
    /// # 参数
    /// - `video_path`: 视频文件路径（存在性由 DAM 进程自行校验）
    /// - `bbox_normalized`: 归一化 bbox，[0,1] 区间的四个浮点数
    /// - `use_sam2`: 是否使用 SAM2 分割掩码
    ///
    /// # 返回
    /// - `Some(String)`: 提取到的描述
    /// - `None`: 分析失败（诊断已写入日志）
    pub fn analyze_video(
        &self,
        video_path: &Path,
        bbox_normalized: [f64; 4],
        use_sam2: bool,
    ) -> Option<String> {
        if use_sam2 {
            self.analyze_with_sam2(video_path, bbox_normalized)
        } else {
            self.analyze_with_bbox(video_path, bbox_normalized)
        }
    }

    /// bbox 掩码 DAM 分析（默认模式 - 快）
    pub fn analyze_with_bbox(
        &self,
        video_path: &Path,
        bbox_normalized: [f64; 4],
    ) -> Option<String> {
        info!("开始 DAM 分析（bbox 掩码）...");
        match self.run_dam(video_path, bbox_normalized, false) {
            Ok(description) => {
                info!("DAM 分析完成: {}", description);
                Some(description)
            }
            Err(e) => {
                error!("DAM 分析失败: {}", e);
                None
            }
        }
    }

    /// SAM2 分割掩码 DAM 分析（可选模式 - 精确但慢）
    pub fn analyze_with_sam2(
        &self,
        video_path: &Path,
        bbox_normalized: [f64; 4],
    ) -> Option<String> {
        info!("开始 DAM 分析（SAM2 分割）...");
        match self.run_dam(video_path, bbox_normalized, true) {
            Ok(description) => {
                info!("DAM 分析完成（SAM2）: {}", description);
                Some(description)
            }
            Err(e) => {
                error!("DAM 分析失败（SAM2）: {}", e);
                None
            }
        }
    }

    /// 组装并同步运行 DAM 子进程，成功时返回提取的描述
    fn run_dam(
        &self,
        video_path: &Path,
        bbox_normalized: [f64; 4],
        use_sam2: bool,
    ) -> Result<String> {
        let mut command = Command::new(&self.dam_script_path);
        command
            .arg("--video_file")
            .arg(video_path)
            .arg("--box")
            .arg(format_bbox(&bbox_normalized))
            .arg("--normalized_coords")
            .arg("--use_box");
        if use_sam2 {
            // 显式请求 SAM2 处理；缺省即 bbox 掩码
            command.arg("--use_sam2");
        }
        command
            .arg("--no_stream")
            .arg("--temperature")
            .arg(self.temperature.to_string())
            .arg("--top_p")
            .arg(self.top_p.to_string())
            .arg("--query")
            .arg(&self.prompt);

        // Windows下隐藏控制台窗口
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let output = command.output()?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            error!("[DAM stderr] ↓↓↓");
            error!("{}", stderr);
            return Err(anyhow!("DAM exited {}", output.status.code().unwrap_or(-1)));
        }

        let raw_output = if stdout.is_empty() { stderr } else { stdout };
        Ok(extract_description(&raw_output))
    }

    /// 替换指令提示词
    pub fn set_prompt(&mut self, new_prompt: String) {
        self.prompt = new_prompt;
        let preview: String = self.prompt.chars().take(50).collect();
        debug!("提示词已更新: {}...", preview);
    }

    /// 更新采样参数，`None` 表示保持原值
    pub fn set_parameters(&mut self, temperature: Option<f64>, top_p: Option<f64>) {
        if let Some(t) = temperature {
            self.temperature = t;
        }
        if let Some(p) = top_p {
            self.top_p = p;
        }
        debug!(
            "采样参数更新: temperature={}, top_p={}",
            self.temperature, self.top_p
        );
    }

    /// 返回当前配置快照
    pub fn get_info(&self) -> AnalyzerInfo {
        AnalyzerInfo {
            dam_script_path: self.dam_script_path.to_string_lossy().to_string(),
            temperature: self.temperature,
            top_p: self.top_p,
            prompt: self.prompt.clone(),
        }
    }
}

/// 将归一化 bbox 格式化为 DAM 脚本可解析的列表字符串，如 "[0.1, 0.2, 0.5, 0.6]"
fn format_bbox(bbox: &[f64; 4]) -> String {
    format!("[{}, {}, {}, {}]", bbox[0], bbox[1], bbox[2], bbox[3])
}

/// 从 DAM 原始输出中提取描述
///
/// 优先取最后一个以 `Description:` 开头的行中最后一个标记之后的文本；
/// 否则过滤进度条、模型加载与警告行后取最后一个非空行；
/// 仍然没有时返回去掉首尾空白的整段输出。
pub fn extract_description(raw_output: &str) -> String {
    let mut desc = "";
    for line in raw_output.lines() {
        if line.starts_with(DESCRIPTION_MARKER) {
            // 同一行出现多个标记时以最后一个为准
            if let Some(idx) = line.rfind(DESCRIPTION_MARKER) {
                desc = line[idx + DESCRIPTION_MARKER.len()..].trim();
            }
        }
    }

    if !desc.is_empty() {
        return desc.to_string();
    }

    // fallback - 跳过进度条、模型加载和警告行，取最后一个干净的行
    let clean_lines: Vec<&str> = raw_output
        .lines()
        .filter(|l| !l.trim().is_empty() && !noise_pattern().is_match(l))
        .collect();

    match clean_lines.last() {
        Some(line) => line.trim().to_string(),
        None => raw_output.trim().to_string(),
    }
}

/// 噪声行匹配（进度条 / 模型加载 / Python 警告）
fn noise_pattern() -> &'static Regex {
    static NOISE_PATTERN: OnceLock<Regex> = OnceLock::new();
    NOISE_PATTERN.get_or_init(|| {
        Regex::new(r"frame loading|propagate in video|Loading checkpoint|UserWarning").unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_extract_description_marker() {
        let raw = "Loading checkpoint shards\nDescription: person waves hand.\n";
        assert_eq!(extract_description(raw), "person waves hand.");
    }

    #[test]
    fn test_extract_description_last_line_wins() {
        let raw = "Description: first attempt.\nframe loading 3/8\nDescription: second attempt.";
        assert_eq!(extract_description(raw), "second attempt.");
    }

    #[test]
    fn test_extract_description_last_marker_in_line() {
        let raw = "Description: outer Description: inner";
        assert_eq!(extract_description(raw), "inner");
    }

    #[test]
    fn test_extract_description_fallback_last_clean_line() {
        let raw = "frame loading 1/8\nLoading checkpoint shards: 100%\nperson sits down.\n";
        assert_eq!(extract_description(raw), "person sits down.");
    }

    #[test]
    fn test_extract_description_all_noise() {
        let raw = "  frame loading 1/8\npropagate in video\n";
        assert_eq!(extract_description(raw), raw.trim());
    }

    #[test]
    fn test_extract_description_blank_output() {
        assert_eq!(extract_description("\n  \n"), "");
    }

    #[test]
    fn test_new_missing_script() {
        let result = DamAnalyzer::new(PathBuf::from("/nonexistent/dam.py"));
        assert!(result.is_err());
    }

    #[test]
    fn test_new_with_defaults() {
        let temp_dir = tempdir().unwrap();
        let script = temp_dir.path().join("dam.py");
        std::fs::write(&script, "#!/usr/bin/env python3\n").unwrap();

        let analyzer = DamAnalyzer::new(script).unwrap();
        let info = analyzer.get_info();
        assert_eq!(info.temperature, 0.1);
        assert_eq!(info.top_p, 0.15);
        assert!(info.prompt.contains("<image>"));
    }

    #[test]
    fn test_set_parameters_partial() {
        let temp_dir = tempdir().unwrap();
        let script = temp_dir.path().join("dam.py");
        std::fs::write(&script, "").unwrap();

        let mut analyzer = DamAnalyzer::new(script).unwrap();
        analyzer.set_parameters(None, Some(0.9));

        let info = analyzer.get_info();
        assert_eq!(info.temperature, 0.1);
        assert_eq!(info.top_p, 0.9);
    }

    #[test]
    fn test_set_prompt() {
        let temp_dir = tempdir().unwrap();
        let script = temp_dir.path().join("dam.py");
        std::fs::write(&script, "").unwrap();

        let mut analyzer = DamAnalyzer::new(script).unwrap();
        analyzer.set_prompt("Describe the motion only.".to_string());
        assert_eq!(analyzer.get_info().prompt, "Describe the motion only.");
    }

    #[test]
    fn test_format_bbox() {
        assert_eq!(format_bbox(&[0.1, 0.2, 0.5, 0.6]), "[0.1, 0.2, 0.5, 0.6]");
    }

    #[cfg(unix)]
    fn write_stub_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("dam_stub.sh");
        std::fs::write(&script, body).unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();
        script
    }

    #[cfg(unix)]
    #[test]
    fn test_analyze_video_with_stub_script() {
        let temp_dir = tempdir().unwrap();
        let script = write_stub_script(
            temp_dir.path(),
            "#!/bin/sh\necho \"Description: person waves hand.\"\n",
        );

        let analyzer = DamAnalyzer::new(script).unwrap();
        let result = analyzer.analyze_video(Path::new("clip.mp4"), [0.1, 0.2, 0.5, 0.6], false);
        assert_eq!(result.as_deref(), Some("person waves hand."));
    }

    #[cfg(unix)]
    #[test]
    fn test_analyze_video_reads_stderr_when_stdout_empty() {
        let temp_dir = tempdir().unwrap();
        let script = write_stub_script(
            temp_dir.path(),
            "#!/bin/sh\necho \"Description: subject stands up.\" 1>&2\n",
        );

        let analyzer = DamAnalyzer::new(script).unwrap();
        let result = analyzer.analyze_video(Path::new("clip.mp4"), [0.0, 0.0, 1.0, 1.0], true);
        assert_eq!(result.as_deref(), Some("subject stands up."));
    }

    #[cfg(unix)]
    #[test]
    fn test_analyze_video_nonzero_exit() {
        let temp_dir = tempdir().unwrap();
        let script = write_stub_script(temp_dir.path(), "#!/bin/sh\nexit 3\n");

        let analyzer = DamAnalyzer::new(script).unwrap();
        let result = analyzer.analyze_video(Path::new("clip.mp4"), [0.1, 0.2, 0.5, 0.6], false);
        assert!(result.is_none());
    }
}
