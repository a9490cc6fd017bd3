//! 陪伴循环的只读数据源：日历、提醒事项、收件箱文件

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::core::ChannelError;

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reminder {
    pub id: String,
    pub title: String,
    pub list: String,
    pub due_at: Option<DateTime<Utc>>,
}

/// 日历：window 内即将开始的事件
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn upcoming(&self, window: Duration) -> Result<Vec<CalendarEvent>, ChannelError>;
}

/// 提醒事项：指定列表（None 为全部）中已过期的提醒
#[async_trait]
pub trait ReminderSource: Send + Sync {
    async fn overdue(&self, list: Option<&str>) -> Result<Vec<Reminder>, ChannelError>;
}

/// 收件箱文件中未分拣条目数（以 `- [ ]` 开头的行）
pub async fn count_untriaged(path: &Path) -> std::io::Result<usize> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content
        .lines()
        .filter(|line| line.trim_start().starts_with("- [ ]"))
        .count())
}

/// 固定内容的日历（测试与演示）
#[derive(Default)]
pub struct StaticCalendar {
    events: Mutex<Vec<CalendarEvent>>,
}

impl StaticCalendar {
    pub fn new(events: Vec<CalendarEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }
}

#[async_trait]
impl CalendarSource for StaticCalendar {
    async fn upcoming(&self, window: Duration) -> Result<Vec<CalendarEvent>, ChannelError> {
        let now = Utc::now();
        let events = self
            .events
            .lock()
            .map_err(|_| ChannelError::FetchFailed("calendar poisoned".into()))?;
        Ok(events
            .iter()
            .filter(|e| e.starts_at >= now && e.starts_at <= now + window)
            .cloned()
            .collect())
    }
}

/// 固定内容的提醒事项（测试与演示）
#[derive(Default)]
pub struct StaticReminders {
    reminders: Mutex<Vec<Reminder>>,
}

impl StaticReminders {
    pub fn new(reminders: Vec<Reminder>) -> Self {
        Self {
            reminders: Mutex::new(reminders),
        }
    }
}

#[async_trait]
impl ReminderSource for StaticReminders {
    async fn overdue(&self, list: Option<&str>) -> Result<Vec<Reminder>, ChannelError> {
        let now = Utc::now();
        let reminders = self
            .reminders
            .lock()
            .map_err(|_| ChannelError::FetchFailed("reminders poisoned".into()))?;
        Ok(reminders
            .iter()
            .filter(|r| list.map_or(true, |l| r.list.eq_ignore_ascii_case(l)))
            .filter(|r| r.due_at.is_some_and(|due| due < now))
            .cloned()
            .collect())
    }
}
