//! Prompt templates handed to launched workers and reviewers.
//!
//! Templates use `{variable}` placeholders expanded at launch time. The
//! commands they mention are the `fleet` CLI operations a worker uses to
//! report back into the store.

use std::collections::HashMap;

use fleet_core::types::Task;

// ---------------------------------------------------------------------------
// PromptTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub template: &'static str,
}

impl PromptTemplate {
    /// Render the template with the given variables.
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut output = self.template.to_string();
        for (key, value) in vars {
            output = output.replace(&format!("{{{key}}}"), value);
        }
        output
    }
}

pub const WORKER_TEMPLATE: PromptTemplate = PromptTemplate {
    name: "worker",
    template: r#"## Task {task_id}: {title}

You are {agent_id}. Work only inside `{working_dir}`.

### Details
- Description: {description}
- Priority: {priority}
- Expected outcome: {expected_outcome}

### Prerequisites (check each one before starting)
{prerequisites}

Mark an item once it is satisfied:
`fleet task check {task_id} --field prerequisites --index <n>`
Items marked for a human cannot be checked by you; stop and report instead.

### Acceptance criteria (review requires all of them)
{acceptance_criteria}

### Last review feedback
{review_feedback}

### Reporting
- Start: `fleet task start {task_id} --agent {agent_id}`
- Heartbeat every few minutes: `fleet agent heartbeat {agent_id}`
- Progress: `fleet task progress {task_id} <0-99> --note "<what changed>"`
- Working memory at least every 30 minutes:
  `fleet agent memory {agent_id} --task {task_id} --notes "<doing>" --blockers "<stuck on>" --next "<next step>"`
- Finished: `fleet task complete {task_id} --note "<summary>"`
- Blocked: `fleet task block {task_id} --reason "<why>"`

End your final message with `Task Completed` once the work is done.
"#,
};

pub const REVIEW_TEMPLATE: PromptTemplate = PromptTemplate {
    name: "review",
    template: r#"## Review {task_id}: {title}

Reviewer: {reviewer_id}. Inspect the work inside `{working_dir}`.

### What was asked
- Description: {description}
- Expected outcome: {expected_outcome}

### Prerequisites
{prerequisites}

### Acceptance criteria
{acceptance_criteria}

### Steps
1. Inspect the changes (`git status -sb`, `git diff --stat`, or file timestamps).
2. Judge correctness against the acceptance criteria, edge cases and regressions.
3. Run tests only when the task or repository names an obvious command.
4. Check each satisfied acceptance item:
   `fleet task check {task_id} --field acceptance --index <n>`
5. Send a heartbeat while reviewing: `fleet agent heartbeat {reviewer_id}`

### Decision
- Approve: `fleet task approve {task_id} --reviewer {reviewer_id}`
- Reject (reason required): `fleet task reject {task_id} --reviewer {reviewer_id} --reason "<what to fix>"`
"#,
};

fn or_na(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => "N/A".to_string(),
    }
}

fn task_vars(task: &Task) -> HashMap<&'static str, String> {
    let mut vars = HashMap::new();
    vars.insert("task_id", task.id.to_string());
    vars.insert("title", task.title.clone());
    vars.insert("description", or_na(task.description.as_deref()));
    vars.insert("working_dir", or_na(task.working_dir.as_deref()));
    vars.insert("expected_outcome", or_na(Some(&task.expected_outcome)));
    vars.insert("prerequisites", or_na(Some(&task.prerequisites)));
    vars.insert("acceptance_criteria", or_na(Some(&task.acceptance_criteria)));
    vars
}

pub fn worker_prompt(task: &Task, agent_id: &str) -> String {
    let mut vars = task_vars(task);
    vars.insert("agent_id", agent_id.to_string());
    vars.insert("priority", format!("{:?}", task.priority).to_lowercase());
    vars.insert("review_feedback", or_na(task.review_feedback.as_deref()));
    WORKER_TEMPLATE.render(&vars)
}

pub fn review_prompt(task: &Task, reviewer_id: &str) -> String {
    let mut vars = task_vars(task);
    vars.insert("reviewer_id", reviewer_id.to_string());
    REVIEW_TEMPLATE.render(&vars)
}
