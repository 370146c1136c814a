//! Budget portal user behaviour.
//!
//! Two classes of users: department analysts (`fag`) working on their own
//! department's cases, and finance ministry analysts (`fin`) reviewing cases
//! across departments. Each user logs in once, remembers the active budget
//! round and then mixes reads, document saves, exports and heartbeats.

use std::time::Duration;

use anyhow::Context;
use futures::{future::BoxFuture, FutureExt};
use rand::Rng;
use serde_json::{json, Value};
use throng::{
    Completion, RegistryError, Session, Task, TaskRegistry, TaskResult, ThinkTime, UserClass,
    Workload, WorkloadError,
};

use crate::api::{BudgetRound, CaseSummary, PortalApi, PASSWORD};

pub const DEPARTMENTS: [&str; 15] = [
    "kld", "ud", "jd", "hod", "kd", "sd", "nfd", "bfd", "aid", "lmd", "kud", "fd", "ofd", "eid",
    "did",
];

/// Session key of the active budget round ID.
pub const ROUND_KEY: &str = "budget_round_id";
/// Session key of the department a `fag` user belongs to.
pub const DEPARTMENT_KEY: &str = "department";

const CACHED_CASES: usize = 20;
const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

const CASE_LIST: &str = "/api/cases/list";
const EXPORT: &str = "/api/export/department-list/word";
const HEARTBEAT: &str = "/api/health [heartbeat]";

/// Both portal user classes, `fag` and `fin` in a 7:3 mix.
pub fn portal_workload(api: &PortalApi) -> Result<Workload, WorkloadError> {
    let registry_error = |class: &str| {
        let class = class.to_owned();
        move |source| WorkloadError::Registry { class, source }
    };
    Workload::new()
        .with_class(fag_user(api).map_err(registry_error("fag"))?)?
        .with_class(fin_user(api).map_err(registry_error("fin"))?)
}

/// Department budget analyst.
pub fn fag_user(api: &PortalApi) -> Result<UserClass, RegistryError> {
    let tasks = TaskRegistry::new()
        .with_task(
            task(api, "view_case_list", 40, "read", |api, s| {
                case_list(api, s, false, CASE_LIST).boxed()
            })
            .with_label(CASE_LIST),
        )?
        .with_task(
            task(api, "view_case_detail", 25, "read", |api, s| {
                case_detail(api, s, "/api/cases/[id]").boxed()
            })
            .with_label("/api/cases/[id]"),
        )?
        .with_task(
            task(api, "save_case_document", 15, "write", |api, s| {
                save_document(api, s, DocumentSection::PROPOSAL, "/api/cases/[id]/document [save]")
                    .boxed()
            })
            .with_label("/api/cases/[id]/document [save]"),
        )?
        .with_task(
            task(api, "view_questions", 5, "read", |api, s| questions(api, s).boxed())
                .with_label("/api/cases/[id]/questions"),
        )?
        .with_task(
            task(api, "export_department_list", 5, "export", |api, s| {
                export_department_list(api, s).boxed()
            })
            .with_label(EXPORT),
        )?
        .with_task(
            task(api, "heartbeat", 10, "background", |api, s| heartbeat(api, s).boxed())
                .with_label(HEARTBEAT),
        )?;

    let hook_api = api.clone();
    Ok(UserClass::new("fag", tasks)
        .with_weight(7)
        .with_think_time(ThinkTime::between(
            Duration::from_secs(3),
            Duration::from_secs(12),
        ))
        .with_on_start(move |s| start_fag(hook_api.clone(), s).boxed()))
}

/// Finance ministry analyst.
pub fn fin_user(api: &PortalApi) -> Result<UserClass, RegistryError> {
    let tasks = TaskRegistry::new()
        .with_task(
            task(api, "view_cross_dept_cases", 30, "read", |api, s| {
                case_list(api, s, true, "/api/cases/list [FIN cross-dept]").boxed()
            })
            .with_label("/api/cases/list [FIN cross-dept]"),
        )?
        .with_task(
            task(api, "view_case_detail", 20, "read", |api, s| {
                case_detail(api, s, "/api/cases/[id] [FIN]").boxed()
            })
            .with_label("/api/cases/[id] [FIN]"),
        )?
        .with_task(
            task(api, "save_fin_assessment", 20, "write", |api, s| {
                save_document(
                    api,
                    s,
                    DocumentSection::FIN_ASSESSMENT,
                    "/api/cases/[id]/document [FIN save]",
                )
                .boxed()
            })
            .with_label("/api/cases/[id]/document [FIN save]"),
        )?
        .with_task(
            task(api, "view_department_lists", 10, "read", |api, s| {
                department_lists(api, s).boxed()
            })
            .with_label("/api/department-lists [view]"),
        )?
        .with_task(
            task(api, "view_my_tasks", 10, "read", |api, s| my_tasks(api, s).boxed())
                .with_label("/api/cases/my-tasks"),
        )?
        .with_task(
            task(api, "export_department_list", 5, "export", |api, s| {
                export_department_list(api, s).boxed()
            })
            .with_label(EXPORT),
        )?
        .with_task(
            task(api, "heartbeat", 5, "background", |api, s| heartbeat(api, s).boxed())
                .with_label(HEARTBEAT),
        )?;

    let hook_api = api.clone();
    Ok(UserClass::new("fin", tasks)
        .with_weight(3)
        .with_think_time(ThinkTime::between(
            Duration::from_secs(3),
            Duration::from_secs(15),
        ))
        .with_on_start(move |s| start_fin(hook_api.clone(), s).boxed()))
}

/// Builds a tagged task whose action gets its own handle on the API client.
fn task<F>(api: &PortalApi, name: &str, weight: u32, tag: &str, action: F) -> Task
where
    F: for<'s> Fn(PortalApi, &'s mut Session) -> BoxFuture<'s, TaskResult>
        + Send
        + Sync
        + 'static,
{
    let api = api.clone();
    Task::new(name, weight, move |session| action(api.clone(), session)).with_tag(tag)
}

async fn start_fag(api: PortalApi, session: &mut Session) -> anyhow::Result<()> {
    let department = DEPARTMENTS[session.rng().gen_range(0..DEPARTMENTS.len())];
    session.set(DEPARTMENT_KEY, department);
    log_in(&api, session, &format!("budsjett1@{department}.dep.no")).await
}

async fn start_fin(api: PortalApi, session: &mut Session) -> anyhow::Result<()> {
    log_in(&api, session, "saksbehandler1@fin.dep.no").await
}

/// Logs in, keeps the token as the session identity and remembers the
/// active budget round if there is one.
async fn log_in(api: &PortalApi, session: &mut Session, email: &str) -> anyhow::Result<()> {
    let token = api
        .login(email, PASSWORD)
        .await
        .with_context(|| format!("logging in as {email}"))?;
    session.set_identity(token);

    let rounds: Result<Vec<BudgetRound>, _> = api
        .get_json(session.identity(), "/api/budget-rounds", &[], "/api/budget-rounds")
        .await;
    match rounds {
        Ok(rounds) => {
            if let Some(active) = rounds.into_iter().find(BudgetRound::is_active) {
                session.set(ROUND_KEY, active.id);
            }
        }
        // users still work without a round, the list endpoints just go unfiltered
        Err(e) => tracing::warn!(user = session.user(), "Budget round discovery failed: {e}"),
    }
    Ok(())
}

fn round_query(session: &Session) -> Vec<(&'static str, String)> {
    session
        .get_str(ROUND_KEY)
        .map(|round| vec![("budget_round_id", round.to_owned())])
        .unwrap_or_default()
}

async fn case_list(
    api: PortalApi,
    session: &mut Session,
    cross_department: bool,
    label: &str,
) -> TaskResult {
    let mut query = round_query(session);
    if cross_department {
        query.push(("my_departments", "false".to_owned()));
    }
    let cases: Vec<CaseSummary> = api
        .get_json(session.identity(), CASE_LIST, &query, label)
        .await?;
    session.set_cached_ids(cases.into_iter().take(CACHED_CASES).map(|case| case.id));
    Ok(Completion::Done)
}

async fn case_detail(api: PortalApi, session: &mut Session, label: &str) -> TaskResult {
    let Some(case) = session.random_cached_id() else {
        return Ok(Completion::Skipped);
    };
    api.get(session.identity(), &format!("/api/cases/{case}"), &[], label)
        .await?;
    Ok(Completion::Done)
}

async fn questions(api: PortalApi, session: &mut Session) -> TaskResult {
    let Some(case) = session.random_cached_id() else {
        return Ok(Completion::Skipped);
    };
    api.get(
        session.identity(),
        &format!("/api/cases/{case}/questions"),
        &[],
        "/api/cases/[id]/questions",
    )
    .await?;
    Ok(Completion::Done)
}

/// The editable section a save targets.
#[derive(Debug, Clone, Copy)]
pub struct DocumentSection {
    pub field_key: &'static str,
    pub title: &'static str,
    pub text_prefix: &'static str,
}

impl DocumentSection {
    pub const PROPOSAL: DocumentSection = DocumentSection {
        field_key: "proposalText",
        title: "Forslag",
        text_prefix: "Lasttestdata",
    };
    pub const FIN_ASSESSMENT: DocumentSection = DocumentSection {
        field_key: "finAssessment",
        title: "FINs vurdering",
        text_prefix: "FIN vurdering",
    };

    /// Section document with the given paragraphs, in the editor's JSON
    /// shape.
    pub fn document(&self, paragraphs: Vec<Value>) -> Value {
        json!({
            "type": "doc",
            "content": [{
                "type": "section",
                "attrs": { "fieldKey": self.field_key },
                "content": [
                    {
                        "type": "sectionTitle",
                        "content": [{ "type": "text", "text": self.title }]
                    },
                    { "type": "sectionContent", "content": paragraphs }
                ]
            }]
        })
    }
}

pub fn paragraph(text: &str) -> Value {
    json!({ "type": "paragraph", "content": [{ "type": "text", "text": text }] })
}

async fn save_document(
    api: PortalApi,
    session: &mut Session,
    section: DocumentSection,
    label: &str,
) -> TaskResult {
    let Some(case) = session.random_cached_id() else {
        return Ok(Completion::Skipped);
    };
    let text = format!("{} {}", section.text_prefix, session.rng().gen_range(1..=9999));
    let body = json!({
        "contentJson": section.document(vec![paragraph(&text)]).to_string(),
        "expectedVersion": 1,
    });
    api.put_json(
        session.identity(),
        &format!("/api/cases/{case}/document"),
        &body,
        label,
    )
    .await?;
    Ok(Completion::Done)
}

async fn department_lists(api: PortalApi, session: &mut Session) -> TaskResult {
    let query = round_query(session);
    api.get(
        session.identity(),
        "/api/department-lists",
        &query,
        "/api/department-lists [view]",
    )
    .await?;
    Ok(Completion::Done)
}

async fn my_tasks(api: PortalApi, session: &mut Session) -> TaskResult {
    api.get(session.identity(), "/api/cases/my-tasks", &[], "/api/cases/my-tasks")
        .await?;
    Ok(Completion::Done)
}

async fn export_department_list(api: PortalApi, session: &mut Session) -> TaskResult {
    api.post(
        session.identity(),
        EXPORT,
        &json!({ "departmentListId": NIL_UUID }),
        EXPORT,
    )
    .await?;
    Ok(Completion::Done)
}

async fn heartbeat(api: PortalApi, session: &mut Session) -> TaskResult {
    api.get(session.identity(), "/api/health", &[], HEARTBEAT)
        .await?;
    Ok(Completion::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use throng::TagFilter;

    fn api() -> PortalApi {
        PortalApi::new("http://localhost:8080", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn classes_follow_the_portal_mix() {
        let workload = portal_workload(&api()).unwrap();
        let classes: Vec<_> = workload
            .classes()
            .map(|c| (c.name().to_owned(), c.weight(), c.tasks().total_weight()))
            .collect();
        assert_eq!(
            classes,
            [("fag".to_owned(), 7, 100), ("fin".to_owned(), 3, 100)]
        );
    }

    #[test]
    fn tag_filtering_narrows_every_class() {
        let writes = portal_workload(&api())
            .unwrap()
            .filtered(&TagFilter::new().include(["write"]))
            .unwrap();
        let names: Vec<Vec<String>> = writes
            .classes()
            .map(|c| c.tasks().tasks().iter().map(|t| t.name().to_owned()).collect())
            .collect();
        assert_eq!(names, [vec!["save_case_document"], vec!["save_fin_assessment"]]);

        let no_exports = portal_workload(&api())
            .unwrap()
            .filtered(&TagFilter::new().exclude(["export"]))
            .unwrap();
        assert!(no_exports
            .classes()
            .all(|c| c.tasks().get("export_department_list").is_none()));
    }

    #[test]
    fn document_carries_field_key_and_text() {
        let doc = DocumentSection::FIN_ASSESSMENT.document(vec![paragraph("FIN vurdering 7")]);
        let section = &doc["content"][0];
        assert_eq!(section["attrs"]["fieldKey"], "finAssessment");
        assert_eq!(section["content"][0]["content"][0]["text"], "FINs vurdering");
        assert_eq!(
            section["content"][1]["content"][0]["content"][0]["text"],
            "FIN vurdering 7"
        );
    }
}
