use crate::error::AutomationError;
use crate::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// 终端进度提示，纯展示用途
pub trait Spinner: Send + Sync {
    fn set_text(&self, text: &str);
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    /// 输出一行到 stdout，不打断进度条
    fn println(&self, text: &str) {
        println!("{}", text);
    }
    /// 输出一行到 stderr
    fn eprintln(&self, text: &str) {
        eprintln!("{}", text);
    }
}

/// 静默模式 / 测试使用
pub struct NoopSpinner;

impl Spinner for NoopSpinner {
    fn set_text(&self, _text: &str) {}
    fn pause(&self) {}
    fn resume(&self) {}
    fn stop(&self) {}
}

/// 基于 indicatif 的旋转提示
pub struct ProgressSpinner {
    bar: ProgressBar,
}

impl ProgressSpinner {
    pub fn new(text: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            bar.set_style(style);
        }
        bar.set_message(text.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl Spinner for ProgressSpinner {
    fn set_text(&self, text: &str) {
        // 只显示第一行，避免刷屏
        let first_line = text.lines().next().unwrap_or_default();
        self.bar.set_message(first_line.chars().take(120).collect::<String>());
    }

    fn pause(&self) {
        self.bar.set_draw_target(ProgressDrawTarget::hidden());
    }

    fn resume(&self) {
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
    }

    fn stop(&self) {
        self.bar.finish_and_clear();
    }

    fn println(&self, text: &str) {
        self.bar.suspend(|| println!("{}", text));
    }

    fn eprintln(&self, text: &str) {
        self.bar.suspend(|| eprintln!("{}", text));
    }
}

/// 交互式问答
pub trait Prompt: Send + Sync {
    fn question(&self, text: &str) -> Result<String>;
}

pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn question(&self, text: &str) -> Result<String> {
        dialoguer::Input::<String>::new()
            .with_prompt(text)
            .allow_empty(true)
            .interact_text()
            .map_err(|e| AutomationError::BuiltinError(format!("Prompt failed: {}", e)))
    }
}

/// 按顺序返回预设答案
#[cfg(test)]
pub struct ScriptedPrompt {
    answers: std::sync::Mutex<std::collections::VecDeque<String>>,
}

#[cfg(test)]
impl ScriptedPrompt {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: std::sync::Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
        }
    }
}

#[cfg(test)]
impl Prompt for ScriptedPrompt {
    fn question(&self, _text: &str) -> Result<String> {
        Ok(self
            .answers
            .lock()
            .map(|mut a| a.pop_front().unwrap_or_default())
            .unwrap_or_default())
    }
}
