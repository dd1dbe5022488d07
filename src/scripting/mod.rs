//! Scripting-scheduler protocol layer (spec §4.4 C4): SLURM-style submit
//! script generation, interactive argument generation, tabular/keyed
//! output parsing, exit-code parsing, and state classification.
//!
//! Grounded on the SLURM job-state shape in the pack's
//! `stjude-rust-labs/sprocket` `slurm_apptainer.rs` backend (terminal-state
//! classification) and `lightforgemedia/spike-lab`'s `slurm_runner.rs`
//! (`sbatch` script construction) — this module reimplements that shape as
//! the generic, back-end-agnostic codec spec §4.4 describes rather than a
//! single hard-coded backend.

use std::collections::HashMap;

use crate::error::{Error, ErrorKind, Result};
use crate::job::JobDescription;

pub const DEFAULT_JOB_NAME: &str = "xenon";

/// Round-trippable single-quote shell escaping (spec §9 "Quoting"):
/// `'` becomes `'\''`, and the whole argument is wrapped in single quotes.
/// Arguments containing only shell-safe characters are still quoted for
/// uniformity — determinism matters more than minimal output here.
pub fn quote_shell_arg(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

fn job_name(desc: &JobDescription) -> String {
    desc.name.clone().unwrap_or_else(|| DEFAULT_JOB_NAME.to_string())
}

/// The back-end-specific launcher prefixed to the command line when
/// `startPerTask` is set (spec §4.4). SLURM's is `srun`.
const PER_TASK_LAUNCHER: &str = "srun";

/// Generate a `#!/bin/sh` submit script for a batch job, in the fixed line
/// order spec §8 scenario 6 pins down.
pub fn generate_submit_script(desc: &JobDescription) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push("#!/bin/sh".to_string());
    lines.push(format!("#SBATCH --job-name={}", quote_shell_arg(&job_name(desc))));
    if let Some(wd) = &desc.working_directory {
        lines.push(format!("#SBATCH --chdir={wd}"));
    }
    if let Some(q) = &desc.queue_name {
        lines.push(format!("#SBATCH --partition={q}"));
    }
    lines.push(format!("#SBATCH --ntasks={}", desc.tasks));
    lines.push(format!("#SBATCH --cpus-per-task={}", desc.cores_per_task));
    if desc.tasks_per_node > 0 {
        lines.push(format!("#SBATCH --ntasks-per-node={}", desc.tasks_per_node));
    }
    if desc.max_runtime > 0 {
        lines.push(format!("#SBATCH --time={}", desc.max_runtime));
    }
    if desc.max_memory > 0 {
        lines.push(format!("#SBATCH --mem={}M", desc.max_memory));
    }
    if desc.temp_space > 0 {
        lines.push(format!("#SBATCH --tmp={}M", desc.temp_space));
    }
    if let Some(stdin) = &desc.stdin {
        lines.push(format!("#SBATCH --input={stdin}"));
    }
    lines.push(format!(
        "#SBATCH --output={}",
        desc.stdout.as_deref().unwrap_or("/dev/null")
    ));
    lines.push(format!(
        "#SBATCH --error={}",
        desc.stderr.as_deref().unwrap_or("/dev/null")
    ));

    for (k, v) in &desc.environment {
        lines.push(format!("export {k}=\"{v}\""));
    }

    lines.push(String::new());

    let mut command_parts: Vec<String> = Vec::new();
    if desc.start_per_task {
        command_parts.push(PER_TASK_LAUNCHER.to_string());
    }
    command_parts.push(desc.executable.clone());
    command_parts.extend(desc.arguments.iter().map(|a| quote_shell_arg(a)));
    lines.push(command_parts.join(" "));

    lines.join("\n") + "\n"
}

/// Generate the flat argument vector for submitting a job interactively
/// (no script file — the scheduler-specific command is invoked directly).
/// Returns `(args, job_name_tag)`; the tag is the unique `--job-name=<uuid>`
/// value used to re-locate the job in the queue later (spec §4.4).
pub fn generate_interactive_args(desc: &JobDescription) -> (Vec<String>, String) {
    let tag = uuid::Uuid::new_v4().to_string();
    let mut args: Vec<String> = vec!["--quiet".to_string(), format!("--job-name={tag}")];

    if let Some(wd) = &desc.working_directory {
        args.push(format!("--chdir={wd}"));
    }
    if let Some(q) = &desc.queue_name {
        args.push(format!("--partition={q}"));
    }
    args.push(format!("--ntasks={}", desc.tasks));
    if desc.tasks_per_node > 0 {
        args.push(format!("--ntasks-per-node={}", desc.tasks_per_node));
    }
    args.push(format!("--cpus-per-task={}", desc.cores_per_task));
    if desc.max_memory > 0 {
        args.push(format!("--mem={}M", desc.max_memory));
    }
    if desc.temp_space > 0 {
        args.push(format!("--tmp={}M", desc.temp_space));
    }
    args.push(format!("--time={}", desc.max_runtime));
    args.extend(desc.scheduler_arguments.iter().cloned());
    args.push(desc.executable.clone());
    args.extend(desc.arguments.iter().cloned());

    (args, tag)
}

/// Interactive-submission validation additional to the scheduler's common
/// checks: no stdin/stdout/stderr redirection and no environment, because
/// these are unsupported over the interactive transport (spec §4.4).
pub fn validate_interactive(adaptor_name: &str, desc: &JobDescription) -> Result<()> {
    if desc.stdin.is_some() || desc.stdout.is_some() || desc.stderr.is_some() {
        return Err(Error::invalid_job_description(
            adaptor_name,
            "interactive scripting jobs cannot redirect stdin/stdout/stderr",
        ));
    }
    if !desc.environment.is_empty() {
        return Err(Error::invalid_job_description(
            adaptor_name,
            "interactive scripting jobs cannot set environment variables",
        ));
    }
    if desc.max_runtime == 0 {
        return Err(Error::invalid_job_description(adaptor_name, "maxRuntime == 0 is invalid"));
    }
    Ok(())
}

// ── State classification (spec §4.4) ───────────────────────────────────────

const RUNNING_STATES: &[&str] = &["CONFIGURING", "RUNNING", "COMPLETING"];
const PENDING_STATES: &[&str] = &["PENDING", "STOPPED", "SUSPENDED", "SPECIAL_EXIT"];
const FAILED_STATES: &[&str] = &[
    "FAILED",
    "CANCELLED",
    "NODE_FAIL",
    "TIMEOUT",
    "PREEMPTED",
    "BOOT_FAIL",
];
const DONE_STATE: &str = "COMPLETED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    Running,
    Pending,
    Failed,
    Done,
    Unknown,
}

/// Classify a raw back-end state string by prefix match against the
/// documented sets, since back-ends may suffix extra detail (`CANCELLED+`,
/// `RUNNING+0`).
pub fn classify_state(state: &str) -> StateClass {
    if state.starts_with(DONE_STATE) {
        return StateClass::Done;
    }
    if RUNNING_STATES.iter().any(|s| state.starts_with(s)) {
        return StateClass::Running;
    }
    if PENDING_STATES.iter().any(|s| state.starts_with(s)) {
        return StateClass::Pending;
    }
    if FAILED_STATES.iter().any(|s| state.starts_with(s)) {
        return StateClass::Failed;
    }
    StateClass::Unknown
}

/// Parse an exit-code field. `"N"` or `"N:S"` (signal number suffix);
/// take the prefix before `:`. Non-numeric is an error.
pub fn parse_exit_code(adaptor_name: &str, field: &str) -> Result<i32> {
    let prefix = field.split(':').next().unwrap_or(field);
    prefix
        .parse::<i32>()
        .map_err(|_| Error::bad_parameter(adaptor_name, format!("invalid exit code field: '{field}'")))
}

/// Derive the exception (if any) implied by a terminal job record, per
/// spec §4.4 "Exception derivation". `reason` is the back-end's free-text
/// reason field (e.g. SLURM's `Reason=`), `"None"` meaning no reason given.
pub fn derive_exception(
    adaptor_name: &str,
    state: &str,
    exit_code: Option<i32>,
    reason: Option<&str>,
) -> Option<Error> {
    let class = classify_state(state);
    if class != StateClass::Failed {
        return None;
    }
    // A legitimately-failed user process: FAILED with a nonzero exit code
    // is not itself an adaptor-level exception.
    if state.starts_with("FAILED") && exit_code.map(|c| c != 0).unwrap_or(false) {
        return None;
    }
    if state.starts_with("CANCELLED") {
        return Some(Error::job_canceled(adaptor_name, "job was cancelled"));
    }
    match reason {
        Some(r) if r != "None" => Some(Error::invalid_job_description(adaptor_name, r)),
        _ => Some(Error::invalid_job_description(adaptor_name, "failed for unknown reason")),
    }
}

// ── Output parsers (spec §4.4) ─────────────────────────────────────────────

/// A parsed job record: state plus exit code, common to all three parse
/// surfaces.
#[derive(Debug, Clone)]
pub struct ParsedJobRecord {
    pub job_id: String,
    pub state: String,
    pub exit_code: Option<i32>,
}

/// Parse the "full dump" surface: a record-per-job map keyed by job id,
/// each record a `Key=Value` space-separated line (e.g. `scontrol show
/// job`'s output). Returns `None` if `job_id` is absent (caller treats as
/// "unknown"), `Err` if the row is malformed or claims a different id
/// (defends against back-ends that silently return an unrelated row).
pub fn parse_full_dump(adaptor_name: &str, dump: &str, job_id: &str) -> Result<Option<ParsedJobRecord>> {
    for line in dump.lines() {
        let fields = parse_key_value_line(line);
        let Some(found_id) = fields.get("JobId").or_else(|| fields.get("JobID")) else {
            continue;
        };
        if found_id != job_id {
            continue;
        }
        let state = fields
            .get("JobState")
            .or_else(|| fields.get("State"))
            .ok_or_else(|| Error::bad_parameter(adaptor_name, format!("record for {job_id} missing State")))?
            .clone();
        let exit_code = match fields.get("ExitCode") {
            Some(f) => Some(parse_exit_code(adaptor_name, f)?),
            None => None,
        };
        return Ok(Some(ParsedJobRecord {
            job_id: found_id.clone(),
            state,
            exit_code,
        }));
    }
    Ok(None)
}

fn parse_key_value_line(line: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for token in line.split_whitespace() {
        if let Some((k, v)) = token.split_once('=') {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

/// Parse the tabular queue listing surface (`sacct`-style): header +
/// whitespace-separated rows with columns `JobID`, `JobName`, `State`,
/// `ExitCode`.
pub fn parse_tabular_queue(adaptor_name: &str, table: &str, job_id: &str) -> Result<Option<ParsedJobRecord>> {
    let mut lines = table.lines();
    let header = match lines.next() {
        Some(h) => h,
        None => return Ok(None),
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    let id_idx = columns.iter().position(|c| *c == "JobID" || *c == "JobId");
    let state_idx = columns.iter().position(|c| *c == "State" || *c == "JobState");
    let exit_idx = columns.iter().position(|c| *c == "ExitCode");

    let (Some(id_idx), Some(state_idx)) = (id_idx, state_idx) else {
        return Err(Error::bad_parameter(adaptor_name, "tabular queue listing missing JobID/State columns"));
    };

    for row in lines {
        let cells: Vec<&str> = row.split_whitespace().collect();
        if cells.len() <= id_idx || cells[id_idx] != job_id {
            continue;
        }
        if cells.len() <= state_idx {
            return Err(Error::bad_parameter(adaptor_name, format!("row for {job_id} missing State column")));
        }
        let exit_code = match exit_idx {
            Some(i) if cells.len() > i => Some(parse_exit_code(adaptor_name, cells[i])?),
            _ => None,
        };
        return Ok(Some(ParsedJobRecord {
            job_id: cells[id_idx].to_string(),
            state: cells[state_idx].to_string(),
            exit_code,
        }));
    }
    Ok(None)
}

/// Parse the lightweight queue-status listing surface: `JOBID  NAME  STATE`.
pub fn parse_queue_status(adaptor_name: &str, table: &str, job_id: &str) -> Result<Option<ParsedJobRecord>> {
    let mut lines = table.lines();
    let header = match lines.next() {
        Some(h) => h,
        None => return Ok(None),
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    let id_idx = columns.iter().position(|c| *c == "JOBID");
    let state_idx = columns.iter().position(|c| *c == "STATE");
    let (Some(id_idx), Some(state_idx)) = (id_idx, state_idx) else {
        return Err(Error::bad_parameter(adaptor_name, "queue status listing missing JOBID/STATE columns"));
    };

    for row in lines {
        let cells: Vec<&str> = row.split_whitespace().collect();
        if cells.len() <= id_idx || cells[id_idx] != job_id {
            continue;
        }
        if cells.len() <= state_idx {
            return Err(Error::bad_parameter(adaptor_name, format!("row for {job_id} missing STATE column")));
        }
        return Ok(Some(ParsedJobRecord {
            job_id: cells[id_idx].to_string(),
            state: cells[state_idx].to_string(),
            exit_code: None,
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_desc() -> JobDescription {
        JobDescription {
            executable: "my_prog".to_string(),
            arguments: vec!["a b".to_string(), "c".to_string()],
            environment: vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())],
            queue_name: Some("short".to_string()),
            tasks: 4,
            cores_per_task: 2,
            max_runtime: 30,
            start_per_task: true,
            name: Some("J".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn script_round_trip_matches_fixed_line_order() {
        let script = generate_submit_script(&base_desc());
        let expected = "\
#!/bin/sh
#SBATCH --job-name='J'
#SBATCH --partition=short
#SBATCH --ntasks=4
#SBATCH --cpus-per-task=2
#SBATCH --time=30
#SBATCH --output=/dev/null
#SBATCH --error=/dev/null
export A=\"1\"
export B=\"2\"

srun my_prog 'a b' c
";
        assert_eq!(script, expected);
    }

    #[test]
    fn quoting_round_trips_embedded_single_quotes() {
        let quoted = quote_shell_arg("it's a test");
        assert_eq!(quoted, r#"'it'\''s a test'"#);
    }

    #[test]
    fn exit_code_parses_signal_suffix() {
        assert_eq!(parse_exit_code("x", "2:15").unwrap(), 2);
        assert!(parse_exit_code("x", "abc").is_err());
    }

    #[test]
    fn state_classification_by_prefix() {
        assert_eq!(classify_state("CANCELLED+"), StateClass::Failed);
        assert_eq!(classify_state("FAILED"), StateClass::Failed);
        assert_eq!(classify_state("RUNNING+0"), StateClass::Running);
        assert_eq!(classify_state("PENDING"), StateClass::Pending);
        assert_eq!(classify_state("COMPLETED"), StateClass::Done);
    }

    #[test]
    fn exception_derivation_rules() {
        assert!(derive_exception("x", "FAILED", Some(1), None).is_none());
        assert!(matches!(
            derive_exception("x", "CANCELLED+", None, None).unwrap().kind,
            ErrorKind::JobCanceled
        ));
        assert!(derive_exception("x", "COMPLETED", Some(0), None).is_none());
        let e = derive_exception("x", "NODE_FAIL", None, Some("node crashed")).unwrap();
        assert_eq!(e.message, "node crashed");
    }

    #[test]
    fn full_dump_rejects_mismatched_id() {
        let dump = "JobId=99 JobState=RUNNING ExitCode=0:0\n";
        let rec = parse_full_dump("x", dump, "99").unwrap().unwrap();
        assert_eq!(rec.state, "RUNNING");
        assert!(parse_full_dump("x", dump, "100").unwrap().is_none());
    }

    #[test]
    fn tabular_queue_parses_named_columns() {
        let table = "JobID JobName State ExitCode\n42 myjob COMPLETED 0:0\n";
        let rec = parse_tabular_queue("x", table, "42").unwrap().unwrap();
        assert_eq!(rec.state, "COMPLETED");
        assert_eq!(rec.exit_code, Some(0));
    }

    #[test]
    fn queue_status_parses_jobid_name_state() {
        let table = "JOBID NAME STATE\n7 job7 PENDING\n";
        let rec = parse_queue_status("x", table, "7").unwrap().unwrap();
        assert_eq!(rec.state, "PENDING");
    }

    #[test]
    fn interactive_validation_rejects_env_and_redirection() {
        let mut d = base_desc();
        d.stdin = None;
        d.stdout = None;
        d.stderr = None;
        d.environment.clear();
        assert!(validate_interactive("x", &d).is_ok());

        let mut redirected = d.clone();
        redirected.stdout = Some("custom.txt".to_string());
        assert!(validate_interactive("x", &redirected).is_err());

        let mut with_env = d;
        with_env.environment.push(("X".to_string(), "1".to_string()));
        assert!(validate_interactive("x", &with_env).is_err());
    }
}
