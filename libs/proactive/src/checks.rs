use tbg_backend::{ActionItem, BackendApi, Goal, Project, RiskSignal};
use time::{Duration, OffsetDateTime};
use time::format_description::well_known::Rfc3339;
use tracing::warn;

/// Projects untouched for longer than this count as stale.
pub const STALE_PROJECT_AGE: Duration = Duration::days(7);

/// Goals inside this runway with low progress count as at risk.
pub const GOAL_RUNWAY_DAYS: i64 = 14;
pub const GOAL_PROGRESS_FLOOR: f64 = 50.0;

/// One failed check, kept so the digest can still be built from the others.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFailure {
    pub check: &'static str,
    pub error: String,
}

/// Outcome of the four per-user checks. Failed checks contribute empty
/// sections plus a [`CheckFailure`]; they never abort the sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProactiveCheckResult {
    pub stale_projects: Vec<Project>,
    pub overdue_actions: Vec<ActionItem>,
    pub at_risk_goals: Vec<Goal>,
    /// Already filtered to high/critical severity.
    pub sprint_risks: Vec<RiskSignal>,
    pub failures: Vec<CheckFailure>,
}

impl ProactiveCheckResult {
    /// True when any check surfaced something worth a digest.
    pub fn has_issues(&self) -> bool {
        !self.stale_projects.is_empty()
            || !self.overdue_actions.is_empty()
            || !self.at_risk_goals.is_empty()
            || !self.sprint_risks.is_empty()
    }
}

fn is_stale(project: &Project, now: OffsetDateTime) -> bool {
    if !project.status.eq_ignore_ascii_case("active") {
        return false;
    }
    match project
        .last_update
        .as_deref()
        .and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
    {
        Some(updated) => now - updated > STALE_PROJECT_AGE,
        // No parseable update timestamp: nothing to measure staleness from.
        None => false,
    }
}

fn is_at_risk(goal: &Goal) -> bool {
    goal.days_remaining > 0
        && goal.days_remaining <= GOAL_RUNWAY_DAYS
        && goal.progress < GOAL_PROGRESS_FLOOR
}

/// Runs the four checks concurrently for one user. Each check settles
/// independently; failures are logged with the user id and check name and
/// recorded on the result.
pub async fn run_checks(
    backend: &dyn BackendApi,
    user_id: &str,
    token: &str,
    now: OffsetDateTime,
) -> ProactiveCheckResult {
    let (projects, briefing, goals, sprint_risks) = tokio::join!(
        backend.list_projects(token),
        backend.morning_briefing(token),
        backend.list_goals(token),
        fetch_sprint_risks(backend, token),
    );

    let mut result = ProactiveCheckResult::default();

    match projects {
        Ok(projects) => {
            result.stale_projects = projects.into_iter().filter(|p| is_stale(p, now)).collect();
        }
        Err(err) => record_failure(&mut result, user_id, "stale_projects", err),
    }

    match briefing {
        Ok(briefing) => result.overdue_actions = briefing.overdue_actions,
        Err(err) => record_failure(&mut result, user_id, "overdue_actions", err),
    }

    match goals {
        Ok(goals) => {
            result.at_risk_goals = goals.into_iter().filter(is_at_risk).collect();
        }
        Err(err) => record_failure(&mut result, user_id, "at_risk_goals", err),
    }

    match sprint_risks {
        Ok(risks) => {
            result.sprint_risks = risks
                .into_iter()
                .filter(RiskSignal::is_high_or_critical)
                .collect();
        }
        Err(err) => record_failure(&mut result, user_id, "sprint_risks", err),
    }

    result
}

async fn fetch_sprint_risks(
    backend: &dyn BackendApi,
    token: &str,
) -> anyhow::Result<Vec<RiskSignal>> {
    match backend.active_sprint(token).await? {
        Some(sprint) => backend.sprint_risks(token, &sprint.id).await,
        None => Ok(Vec::new()),
    }
}

fn record_failure(
    result: &mut ProactiveCheckResult,
    user_id: &str,
    check: &'static str,
    err: anyhow::Error,
) {
    warn!(user_id = %user_id, check = check, error = %err, "proactive check failed");
    result.failures.push(CheckFailure {
        check,
        error: err.to_string(),
    });
}
