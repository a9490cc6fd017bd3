//! 提示词拼装：首行写模式标记，后端据此切换角色

use crate::connector::TurnMode;
use crate::store::Run;

/// 按字符截断，超长时追加省略号
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn with_preamble(team: Option<&str>, body: String) -> String {
    match team {
        Some(preamble) if !preamble.trim().is_empty() => {
            format!("{}\n{}\n\n{}", TurnMode::Chat.marker(), preamble.trim(), body)
        }
        _ => format!("{}\n{}", TurnMode::Chat.marker(), body),
    }
}

pub fn chat(team: Option<&str>, text: &str) -> String {
    with_preamble(team, text.to_string())
}

pub fn idea(team: Option<&str>, text: &str) -> String {
    with_preamble(
        team,
        format!(
            "Capture and expand this idea. Suggest two or three concrete next steps, but do not act on them.\n\n{text}"
        ),
    )
}

pub fn plan_only(team: Option<&str>, text: &str) -> String {
    with_preamble(
        team,
        format!("Draft a short plan for the following. This is advice only; nothing will be executed.\n\n{text}"),
    )
}

pub fn planner(run: &Run, kind: &str) -> String {
    format!(
        "{}\nYou are planning a {kind} that needs the user's approval before anything runs.\n\
         Workspace: {}\nRisk: {}\nRequest: {}\n\n\
         Reply with a short numbered plan. Do not change anything yet.",
        TurnMode::Planner.marker(),
        run.cwd,
        run.risk_level.as_str(),
        run.intent,
    )
}

pub fn executor(run: &Run, plan: &str) -> String {
    format!(
        "{}\nThe user approved this plan. Carry it out in the workspace and report what you did.\n\
         Workspace: {}\nRequest: {}\n\nApproved plan:\n{}",
        TurnMode::Executor.marker(),
        run.cwd,
        run.intent,
        plan,
    )
}

pub fn verifier(run: &Run, execution_output: &str) -> String {
    format!(
        "{}\nCheck that the request below was actually completed. Reply with a one-line verdict and any problems found.\n\
         Workspace: {}\nRequest: {}\n\nExecution report:\n{}",
        TurnMode::Verifier.marker(),
        run.cwd,
        run.intent,
        execution_output,
    )
}

/// 陪伴循环：观察列表 -> 一条简短消息，或 EMPTY
pub fn companion(observations: &[String], local_time: &str) -> String {
    let list = observations
        .iter()
        .map(|o| format!("- {o}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{}\nLocal time: {local_time}\nObservations:\n{list}\n\n\
         If any of these deserve the user's attention right now, write one short friendly message about them.\n\
         If nothing is worth interrupting for, reply with exactly EMPTY.",
        TurnMode::Companion.marker(),
    )
}

/// 每日摘要 / 每周回顾
pub fn digest(title: &str, facts: &[String]) -> String {
    let list = if facts.is_empty() {
        "- (no recorded activity)".to_string()
    } else {
        facts
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "{}\nWrite the user's {title} from these facts. Keep it brief.\n{list}",
        TurnMode::Digest.marker(),
    )
}
