//! Renders check results into chat-ready digests.

use tbg_backend::MorningBriefing;

use crate::ProactiveCheckResult;

/// Formats one user's digest. Sections only appear when non-empty, so the
/// output stays short on quiet days; callers skip sending entirely when
/// [`ProactiveCheckResult::has_issues`] is false.
pub fn format_digest(result: &ProactiveCheckResult) -> String {
    let mut out = String::from("Here's what needs your attention:\n");

    if !result.stale_projects.is_empty() {
        out.push_str(&format!(
            "\n*Stale projects* ({}):\n",
            result.stale_projects.len()
        ));
        for project in &result.stale_projects {
            out.push_str(&format!("• {} — no updates in over a week\n", project.name));
        }
    }

    if !result.overdue_actions.is_empty() {
        out.push_str(&format!(
            "\n*Overdue actions* ({}):\n",
            result.overdue_actions.len()
        ));
        for action in &result.overdue_actions {
            match &action.due_date {
                Some(due) => out.push_str(&format!("• {} (due {due})\n", action.title)),
                None => out.push_str(&format!("• {}\n", action.title)),
            }
        }
    }

    if !result.at_risk_goals.is_empty() {
        out.push_str(&format!(
            "\n*Goals at risk* ({}):\n",
            result.at_risk_goals.len()
        ));
        for goal in &result.at_risk_goals {
            out.push_str(&format!(
                "• {} — {}% done, {} days left\n",
                goal.title,
                goal.progress.round() as i64,
                goal.days_remaining
            ));
        }
    }

    if !result.sprint_risks.is_empty() {
        out.push_str(&format!(
            "\n*Sprint risks* ({}):\n",
            result.sprint_risks.len()
        ));
        for risk in &result.sprint_risks {
            out.push_str(&format!(
                "• [{}] {}\n",
                risk.severity.to_ascii_uppercase(),
                risk.title
            ));
        }
    }

    out.trim_end().to_string()
}

/// Formats the short WhatsApp morning briefing.
pub fn format_briefing(briefing: &MorningBriefing) -> Option<String> {
    if briefing.overdue_actions.is_empty() {
        return None;
    }
    let mut out = format!(
        "Good morning! You have {} overdue action{}:\n",
        briefing.overdue_actions.len(),
        if briefing.overdue_actions.len() == 1 {
            ""
        } else {
            "s"
        }
    );
    for action in &briefing.overdue_actions {
        out.push_str(&format!("• {}\n", action.title));
    }
    Some(out.trim_end().to_string())
}
