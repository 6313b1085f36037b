//! Flow Launcher SSH/SCP plugin backend
//!
//! Classifies a free-text launcher query into one of the supported command
//! shapes (connect, list, add, remove, transfer), returns a ranked list of
//! suggestions, and executes the selected action by spawning ssh/scp or by
//! mutating the saved-profile file.
//!
//! # Input (first CLI argument)
//! JSON payload with fields: method, parameters
//!
//! # Output (via stdout)
//! For `query`: JSON with a result array of suggestions. Action methods
//! produce no structured output, only log lines on stderr.
//!
//! # Failure policy
//! Nothing crosses the process boundary as an error: a missing or malformed
//! profile file degrades to an empty profile set, spawn failures are logged,
//! and the process always exits 0 with (at worst) an empty result.

use colored::Colorize;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::{env, fs, io, thread};
use thiserror::Error;
use tracing::{debug, error, info, warn};

// ============================================================================
// Constants
// ============================================================================

/// Saved profiles live next to the executable, one JSON object per install.
const PROFILES_FILE: &str = "ssh_profiles.json";

/// Icon shipped with the plugin package; attached to every suggestion.
const ICON_PATH: &str = "Images\\app.png";

/// Launcher sentinel: put the given text back into the search box.
const REFINE_METHOD: &str = "Flow.Launcher.PutQueryInSearch";

/// A catalog record matches when its best field score is below this.
/// Scores are normalized distances: 0 = exact, 1 = no relation.
const FUZZY_THRESHOLD: f64 = 0.4;

lazy_static! {
    // Strips the "d " prefix of a direct-connect query, however many spaces.
    static ref RE_DIRECT_PREFIX: Regex = Regex::new(r"^d\s+").unwrap();
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("JSON wire format error: {0}")]
    Wire(#[from] serde_json::Error),

    #[error("failed to read profiles from {path}: {source}")]
    ProfileRead { path: PathBuf, source: io::Error },

    #[error("failed to parse profiles at {path}: {source}")]
    ProfileParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode profiles: {0}")]
    ProfileEncode(serde_json::Error),

    #[error("failed to write profiles to {path}: {source}")]
    ProfileWrite { path: PathBuf, source: io::Error },

    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
}

// ============================================================================
// Wire Types (launcher JSON-RPC contract)
// ============================================================================

/// Invocation payload passed by the launcher as the first CLI argument.
#[derive(Debug, Deserialize)]
pub struct Invocation {
    pub method: String,

    #[serde(default)]
    pub parameters: Vec<String>,
}

/// Response payload for `query` invocations.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub result: Vec<Suggestion>,
}

/// Action attached to a suggestion. The launcher calls this plugin back with
/// `method`/`parameters` when the suggestion is selected, except for the
/// refine sentinel which it handles itself.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RpcAction {
    pub method: String,
    pub parameters: Vec<String>,
}

/// One row in the launcher's result list.
///
/// `action` is `None` for display-only rows (the launcher omits the key);
/// an action with an empty method is a selectable-but-inert notice.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Suggestion {
    #[serde(rename = "Title")]
    pub title: String,

    #[serde(rename = "Subtitle")]
    pub subtitle: String,

    #[serde(rename = "IcoPath")]
    pub ico_path: String,

    #[serde(rename = "JsonRPCAction", skip_serializing_if = "Option::is_none")]
    pub action: Option<RpcAction>,
}

impl Suggestion {
    fn display(title: impl Into<String>, subtitle: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            subtitle: subtitle.into(),
            ico_path: ICON_PATH.to_string(),
            action: None,
        }
    }

    fn execute(
        title: impl Into<String>,
        subtitle: impl Into<String>,
        method: &str,
        parameters: Vec<String>,
    ) -> Self {
        Self {
            action: Some(RpcAction {
                method: method.to_string(),
                parameters,
            }),
            ..Self::display(title, subtitle)
        }
    }

    /// Non-terminal suggestion: puts `query_text` back into the search box.
    fn refine(title: impl Into<String>, subtitle: impl Into<String>, query_text: String) -> Self {
        Self::execute(title, subtitle, REFINE_METHOD, vec![query_text])
    }

    /// Display-only notice carrying an empty action object.
    fn notice(title: impl Into<String>, subtitle: impl Into<String>) -> Self {
        Self::execute(title, subtitle, "", Vec::new())
    }
}

// ============================================================================
// Command Catalog
// ============================================================================

/// A supported command shape with display metadata and fuzzy-discovery hints.
pub struct CommandDescriptor {
    pub title: &'static str,
    /// Refine text for the command. A trailing space means "awaiting more
    /// input" so the cursor lands ready for the next token.
    pub subtitle: &'static str,
    pub keywords: &'static [&'static str],
}

const LIST_PROFILES_TITLE: &str = "List Profiles";
const REMOVE_PROFILE_TITLE: &str = "Remove Profile";

const COMMANDS: [CommandDescriptor; 6] = [
    CommandDescriptor {
        title: "Direct SSH",
        subtitle: "ssh d ",
        keywords: &["direct", "connect", "shell"],
    },
    CommandDescriptor {
        title: LIST_PROFILES_TITLE,
        subtitle: "ssh profiles",
        keywords: &["list", "profiles", "show"],
    },
    CommandDescriptor {
        title: "Add Profile",
        subtitle: "ssh add ",
        keywords: &["add", "save", "profile"],
    },
    CommandDescriptor {
        title: REMOVE_PROFILE_TITLE,
        subtitle: "ssh remove",
        keywords: &["remove", "delete", "profile"],
    },
    CommandDescriptor {
        title: "Direct SCP",
        subtitle: "ssh scp d ",
        keywords: &["scp", "transfer", "direct", "file"],
    },
    CommandDescriptor {
        title: "Profile SCP",
        subtitle: "ssh scp profiles ",
        keywords: &["scp", "transfer", "profile", "file"],
    },
];

fn with_trailing_space(text: &str) -> String {
    if text.ends_with(' ') {
        text.to_string()
    } else {
        format!("{text} ")
    }
}

// ============================================================================
// Profile Store
// ============================================================================

/// Profile name -> connection target. A sorted map keeps every profile
/// enumeration (and therefore the suggestion output) byte-for-byte stable.
pub type ProfileMap = BTreeMap<String, String>;

/// Persistence for saved connection profiles.
///
/// Load failures degrade to an empty map and save failures are logged, never
/// raised: the interactive flow must not crash on a broken or missing file.
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the default location, next to the executable.
    pub fn default_location() -> Self {
        let dir = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self::at(dir.join(PROFILES_FILE))
    }

    fn try_load(&self) -> Result<ProfileMap, PluginError> {
        if !self.path.exists() {
            debug!("no profile file at {:?}, starting empty", self.path);
            return Ok(ProfileMap::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| PluginError::ProfileRead {
            path: self.path.clone(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| PluginError::ProfileParse {
            path: self.path.clone(),
            source,
        })
    }

    /// Load saved profiles, degrading to an empty map on any failure.
    pub fn load(&self) -> ProfileMap {
        match self.try_load() {
            Ok(profiles) => profiles,
            Err(err) => {
                warn!("{err}; continuing with no profiles");
                ProfileMap::new()
            }
        }
    }

    /// Replace the stored profiles. Writes to a sibling temp file and renames
    /// it over the target so concurrent readers never observe a torn write.
    pub fn save(&self, profiles: &ProfileMap) -> Result<(), PluginError> {
        let content = serde_json::to_string_pretty(profiles).map_err(PluginError::ProfileEncode)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|source| PluginError::ProfileWrite {
            path: self.path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| PluginError::ProfileWrite {
            path: self.path.clone(),
            source,
        })?;

        debug!("saved {} profiles to {:?}", profiles.len(), self.path);
        Ok(())
    }

    /// Insert or silently overwrite a profile.
    pub fn add(&self, name: &str, target: &str) {
        let mut profiles = self.load();
        profiles.insert(name.to_string(), target.to_string());
        if let Err(err) = self.save(&profiles) {
            error!("{err}");
        }
    }

    /// Delete a profile; deleting an unknown name is a no-op.
    pub fn remove(&self, name: &str) {
        let mut profiles = self.load();
        if profiles.remove(name).is_none() {
            debug!("no profile named {name:?} to remove");
        }
        if let Err(err) = self.save(&profiles) {
            error!("{err}");
        }
    }
}

// ============================================================================
// Fuzzy Matcher
// ============================================================================

/// A record that exposes the field strings fuzzy search runs over.
pub trait Searchable {
    fn search_fields(&self) -> Vec<&str>;
}

impl Searchable for CommandDescriptor {
    fn search_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.title, self.subtitle];
        fields.extend_from_slice(self.keywords);
        fields
    }
}

/// Borrowed view of one stored profile, searchable by name and target.
pub struct ProfileRecord<'a> {
    pub name: &'a str,
    pub target: &'a str,
}

impl Searchable for ProfileRecord<'_> {
    fn search_fields(&self) -> Vec<&str> {
        vec![self.name, self.target]
    }
}

/// A catalog hit. Lower score = more similar; 0 is an exact field match.
pub struct CatalogMatch<'a, T> {
    pub item: &'a T,
    pub score: f64,
}

/// Character-level edit distance, two-row dynamic program.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];
    for (i, &char_a) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &char_b) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(char_a != char_b);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Edit distance scaled into [0, 1] by the longer string.
fn normalized_distance(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 0.0;
    }
    levenshtein(a, b) as f64 / longest as f64
}

/// Best score of a lowercased query against one field.
///
/// Takes the minimum over the whole field and its whitespace tokens, plus a
/// discounted prefix score so partial words ("dir" for "direct") rank as
/// completions instead of being over-penalized by raw edit distance.
fn field_score(query: &str, field: &str) -> f64 {
    let field = field.to_lowercase();
    let mut best = normalized_distance(query, &field);

    for token in field.split_whitespace() {
        best = best.min(normalized_distance(query, token));

        if token.starts_with(query) {
            let token_len = token.chars().count();
            let query_len = query.chars().count();
            best = best.min((token_len - query_len) as f64 / token_len as f64 * 0.5);
        }
    }

    best
}

/// Approximate search over `items`, returning hits within the similarity
/// threshold in ascending score order. Ties keep catalog insertion order
/// (the sort is stable). An empty catalog yields an empty result.
pub fn search_catalog<'a, T: Searchable>(query: &str, items: &'a [T]) -> Vec<CatalogMatch<'a, T>> {
    let query = query.to_lowercase();

    let mut matches: Vec<CatalogMatch<'a, T>> = items
        .iter()
        .filter_map(|item| {
            let best = item
                .search_fields()
                .iter()
                .map(|field| field_score(&query, field))
                .fold(f64::INFINITY, f64::min);
            (best < FUZZY_THRESHOLD).then_some(CatalogMatch { item, score: best })
        })
        .collect();

    matches.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal));
    matches
}

// ============================================================================
// Query Classifier / Suggestion Builder
// ============================================================================

/// One exact-shape rule. `None` means the rule does not apply and the cascade
/// keeps going; `Some` ends the cascade even when the vec is empty, in which
/// case fuzzy discovery takes over.
type Rule = fn(&str, &ProfileMap) -> Option<Vec<Suggestion>>;

/// Ordered cascade: first applicable rule wins. Adding a command shape is a
/// table insertion, not another branch in a conditional.
const RULES: [Rule; 7] = [
    rule_empty_guide,
    rule_direct_connect,
    rule_list_profiles,
    rule_add_profile,
    rule_remove_profile,
    rule_direct_scp,
    rule_profile_scp,
];

/// Classify a raw query into an ordered suggestion list.
///
/// Output order is strictly append order; the matcher's score ordering is
/// used within a fuzzy stage but the final list is never re-sorted.
pub fn build_suggestions(query: &str, profiles: &ProfileMap) -> Vec<Suggestion> {
    let args = query.trim();

    for rule in RULES {
        if let Some(suggestions) = rule(args, profiles) {
            if !suggestions.is_empty() {
                return suggestions;
            }
            // The shape matched but had nothing concrete to offer (e.g. an
            // under-specified add): fall through to fuzzy discovery.
            break;
        }
    }

    fallback_discovery(args, profiles)
}

fn connect_suggestion(name: &str, target: &str) -> Suggestion {
    Suggestion::execute(
        format!("Profile: {name}"),
        format!("Connect to {target}"),
        "do_ssh_connect",
        vec![target.to_string()],
    )
}

fn remove_suggestion(name: &str, target: &str) -> Suggestion {
    Suggestion::execute(
        format!("Remove Profile: {name}"),
        format!("Delete profile: {target}"),
        "do_remove_profile",
        vec![name.to_string()],
    )
}

/// Empty input: a header plus one refine entry per supported command.
fn rule_empty_guide(args: &str, _profiles: &ProfileMap) -> Option<Vec<Suggestion>> {
    if !args.is_empty() {
        return None;
    }

    let mut suggestions = vec![Suggestion::display("Quick SSH guide", "Available commands:")];
    suggestions.extend(COMMANDS.iter().map(|command| {
        Suggestion::refine(
            command.title,
            command.subtitle,
            with_trailing_space(command.subtitle),
        )
    }));
    Some(suggestions)
}

/// `d <target>`: connect directly to whatever follows the prefix.
fn rule_direct_connect(args: &str, _profiles: &ProfileMap) -> Option<Vec<Suggestion>> {
    if !args.starts_with("d ") {
        return None;
    }

    let target = RE_DIRECT_PREFIX.replace(args, "");
    Some(vec![Suggestion::execute(
        format!("SSH Connect: {target}"),
        "Connect directly using SSH",
        "do_ssh_connect",
        vec![target.to_string()],
    )])
}

/// `profiles`: one connect entry per stored profile.
fn rule_list_profiles(args: &str, profiles: &ProfileMap) -> Option<Vec<Suggestion>> {
    if args != "profiles" {
        return None;
    }

    Some(
        profiles
            .iter()
            .map(|(name, target)| connect_suggestion(name, target))
            .collect(),
    )
}

/// `add <name> <target...>`: save a profile. Fewer than two tokens is "not
/// enough typed yet", not an error, and produces nothing.
fn rule_add_profile(args: &str, _profiles: &ProfileMap) -> Option<Vec<Suggestion>> {
    let rest = args.strip_prefix("add ")?;

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 2 {
        return Some(Vec::new());
    }

    let name = tokens[0];
    let target = tokens[1..].join(" ");
    Some(vec![Suggestion::execute(
        format!("Add Profile: {name}"),
        format!("Save SSH connection: {target}"),
        "do_add_profile",
        vec![name.to_string(), target],
    )])
}

/// `remove`: one delete entry per stored profile.
fn rule_remove_profile(args: &str, profiles: &ProfileMap) -> Option<Vec<Suggestion>> {
    if args != "remove" {
        return None;
    }

    Some(
        profiles
            .iter()
            .map(|(name, target)| remove_suggestion(name, target))
            .collect(),
    )
}

/// `scp d <args...>`: direct transfer, arguments passed through verbatim.
fn rule_direct_scp(args: &str, _profiles: &ProfileMap) -> Option<Vec<Suggestion>> {
    let rest = args.strip_prefix("scp d ")?.trim();

    Some(vec![Suggestion::execute(
        format!("SCP Transfer: {rest}"),
        "Transfer file using SCP",
        "do_scp_transfer",
        vec![rest.to_string()],
    )])
}

/// `scp profiles [name [file destination]]`: the profile-transfer sub-cascade.
fn rule_profile_scp(args: &str, profiles: &ProfileMap) -> Option<Vec<Suggestion>> {
    let rest = args.strip_prefix("scp profiles ")?.trim();

    // Nothing after the prefix yet: offer every profile as a refinement.
    if rest.is_empty() {
        return Some(
            profiles
                .iter()
                .map(|(name, target)| {
                    Suggestion::refine(
                        format!("SCP to Profile: {name}"),
                        format!("Transfer file to {target}"),
                        format!("ssh scp profiles {name} "),
                    )
                })
                .collect(),
        );
    }

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    let candidate = tokens[0];
    let remainder = tokens[1..].join(" ");

    // Exact (case-insensitive) profile name: executable transfer.
    let exact = profiles
        .iter()
        .find(|(name, _)| name.to_lowercase() == candidate.to_lowercase());
    if let Some((name, target)) = exact {
        let subtitle = if remainder.is_empty() {
            format!("Transfer file to {target}")
        } else {
            format!("Transfer file to {target}:{remainder}")
        };
        return Some(vec![Suggestion::execute(
            format!("SCP to Profile: {name}"),
            subtitle,
            "do_scp_profile_transfer",
            vec![name.to_string(), remainder],
        )]);
    }

    // Otherwise suggest near-miss profiles as refinements.
    let records: Vec<ProfileRecord> = profiles
        .iter()
        .map(|(name, target)| ProfileRecord { name, target })
        .collect();
    let hits = search_catalog(candidate, &records);

    let mut suggestions: Vec<Suggestion> = hits
        .iter()
        .map(|hit| {
            let name = hit.item.name;
            Suggestion::refine(
                format!("SCP to Profile: {name}"),
                format!("Transfer file using SCP to profile {name}"),
                format!("ssh scp profiles {name} {remainder}"),
            )
        })
        .collect();

    if suggestions.is_empty() && !candidate.is_empty() {
        suggestions.push(Suggestion::notice(
            format!("SCP to Profile: {candidate} (profile not found)"),
            "Transfer file using SCP to a profile",
        ));
    }

    Some(suggestions)
}

/// Fuzzy discovery, run only when the exact cascade produced nothing.
///
/// Stage (a) searches the command catalog; listing/removal hits expand to
/// their per-profile entries directly. Stage (b) independently appends a
/// connect entry when the query names a stored profile exactly. A profile
/// surfacing through both stages stays duplicated on purpose.
fn fallback_discovery(args: &str, profiles: &ProfileMap) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();

    for hit in search_catalog(args, &COMMANDS) {
        match hit.item.title {
            LIST_PROFILES_TITLE => {
                suggestions.extend(
                    profiles
                        .iter()
                        .map(|(name, target)| connect_suggestion(name, target)),
                );
            }
            REMOVE_PROFILE_TITLE => {
                suggestions.extend(
                    profiles
                        .iter()
                        .map(|(name, target)| remove_suggestion(name, target)),
                );
            }
            _ => {
                suggestions.push(Suggestion::refine(
                    hit.item.title,
                    hit.item.subtitle,
                    with_trailing_space(hit.item.subtitle),
                ));
            }
        }
    }

    let exact = profiles
        .iter()
        .find(|(name, _)| name.to_lowercase() == args.to_lowercase());
    if let Some((name, target)) = exact {
        suggestions.push(connect_suggestion(name, target));
    }

    suggestions
}

// ============================================================================
// Action Dispatcher
// ============================================================================

/// A resolved external command, ready to hand to the spawner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Run a command line through the platform shell, mirroring how the launcher
/// host would: callers supply source/destination syntax verbatim.
#[cfg(windows)]
fn shell(line: String) -> ShellCommand {
    ShellCommand {
        program: "cmd".to_string(),
        args: vec!["/C".to_string(), line],
    }
}

#[cfg(not(windows))]
fn shell(line: String) -> ShellCommand {
    ShellCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), line],
    }
}

/// Interactive session in a fresh terminal context. On Windows that is a new
/// PowerShell window; elsewhere terminal provisioning belongs to the host and
/// ssh is launched directly.
#[cfg(windows)]
fn connect_command(target: &str) -> ShellCommand {
    shell(format!("start powershell -NoExit -Command \"ssh {target}\""))
}

#[cfg(not(windows))]
fn connect_command(target: &str) -> ShellCommand {
    shell(format!("ssh {target}"))
}

fn scp_command(raw_args: &str) -> ShellCommand {
    shell(format!("scp {raw_args}"))
}

/// Resolve a profile transfer. Unknown profile: `None`, deliberately silent.
///
/// Only the first two whitespace tokens of `scp_args` are honored (file and
/// destination); anything further is dropped. A quirk of the established
/// query syntax, kept under test rather than fixed.
fn scp_profile_command(profiles: &ProfileMap, name: &str, scp_args: &str) -> Option<ShellCommand> {
    let target = profiles.get(name)?;

    let mut tokens = scp_args.split_whitespace();
    let file = tokens.next().unwrap_or("");
    let destination = tokens.next().unwrap_or("");

    Some(shell(format!("scp {file} {target}:{destination}")))
}

/// Fire-and-forget spawn. A detached thread drains the child's output into
/// the log and reaps it; the dispatcher never waits, so a launched session
/// outlives this process.
fn spawn_detached(label: &str, command: ShellCommand) -> Result<(), PluginError> {
    debug!("spawning {} {:?}", command.program, command.args);

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| PluginError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let thread_label = label.to_string();
    let capture = thread::Builder::new()
        .name("output-capture".to_string())
        .spawn(move || {
            if let Some(mut stdout) = child.stdout.take() {
                let mut output = String::new();
                if stdout.read_to_string(&mut output).is_ok() && !output.trim().is_empty() {
                    debug!("{thread_label} stdout: {}", output.trim_end());
                }
            }
            if let Some(mut stderr) = child.stderr.take() {
                let mut output = String::new();
                if stderr.read_to_string(&mut output).is_ok() && !output.trim().is_empty() {
                    warn!("{thread_label} stderr: {}", output.trim_end());
                }
            }
            match child.wait() {
                Ok(status) if status.success() => debug!("{thread_label} completed"),
                Ok(status) => error!("{thread_label} exited with {status}"),
                Err(err) => error!("failed to wait on {thread_label}: {err}"),
            }
        });

    if let Err(err) = capture {
        error!("failed to start output capture for {label}: {err}");
    }

    Ok(())
}

/// Execute a selected action. Every operation is independent and every
/// failure is logged rather than propagated.
pub fn dispatch(method: &str, parameters: &[String], store: &ProfileStore) {
    let param = |idx: usize| parameters.get(idx).map(String::as_str).unwrap_or("");

    match method {
        "do_ssh_connect" => {
            let target = param(0);
            info!("opening SSH session to {target}");
            if let Err(err) = spawn_detached("ssh", connect_command(target)) {
                error!("{err}");
            }
        }
        "do_add_profile" => store.add(param(0), param(1)),
        "do_remove_profile" => store.remove(param(0)),
        "do_scp_transfer" => {
            let raw_args = param(0);
            info!("starting SCP transfer: {raw_args}");
            if let Err(err) = spawn_detached("scp", scp_command(raw_args)) {
                error!("{err}");
            }
        }
        "do_scp_profile_transfer" => {
            let profiles = store.load();
            match scp_profile_command(&profiles, param(0), param(1)) {
                Some(command) => {
                    info!("starting SCP transfer to profile {:?}", param(0));
                    if let Err(err) = spawn_detached("scp", command) {
                        error!("{err}");
                    }
                }
                None => debug!("no profile named {:?}, skipping transfer", param(0)),
            }
        }
        other => warn!("unsupported action method {other:?}"),
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn emit_empty_result() {
    let empty = QueryResponse { result: Vec::new() };
    println!(
        "{}",
        serde_json::to_string(&empty).unwrap_or_else(|_| r#"{"result":[]}"#.to_string())
    );
}

fn log_suggestions(suggestions: &[Suggestion]) {
    for suggestion in suggestions {
        let kind = match &suggestion.action {
            None => "info".white(),
            Some(action) if action.method == REFINE_METHOD => "refine".yellow(),
            Some(action) if action.method.is_empty() => "notice".red(),
            Some(_) => "run".green(),
        };
        info!(
            "{} {} - {}",
            kind,
            suggestion.title.bold(),
            suggestion.subtitle
        );
    }
}

fn main() {
    // Initialize tracing if RUST_LOG is set
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        error!("{err}");
        // The launcher treats any stdout as the response; degrade to an
        // empty result instead of surfacing the failure.
        emit_empty_result();
    }
}

fn run() -> Result<(), PluginError> {
    let Some(payload) = env::args().nth(1) else {
        // Invoked without a payload: an empty result, not an error.
        emit_empty_result();
        return Ok(());
    };

    debug!("received payload: {payload}");
    let invocation: Invocation = serde_json::from_str(&payload)?;

    let store = ProfileStore::default_location();

    match invocation.method.as_str() {
        "query" => {
            let query = invocation
                .parameters
                .first()
                .map(String::as_str)
                .unwrap_or("");
            let profiles = store.load();
            let suggestions = build_suggestions(query, &profiles);

            info!(
                "query {:?} -> {} suggestions",
                query.trim(),
                suggestions.len()
            );
            log_suggestions(&suggestions);

            let response = QueryResponse {
                result: suggestions,
            };
            println!("{}", serde_json::to_string(&response)?);
        }
        method => dispatch(method, &invocation.parameters, &store),
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_map(pairs: &[(&str, &str)]) -> ProfileMap {
        pairs
            .iter()
            .map(|(name, target)| (name.to_string(), target.to_string()))
            .collect()
    }

    fn action(suggestion: &Suggestion) -> &RpcAction {
        suggestion
            .action
            .as_ref()
            .expect("suggestion has an action")
    }

    // ---- query classifier: exact cascade ----

    #[test]
    fn empty_query_lists_guide() {
        let suggestions = build_suggestions("", &ProfileMap::new());

        assert_eq!(suggestions.len(), 1 + COMMANDS.len());
        assert_eq!(suggestions[0].title, "Quick SSH guide");
        assert!(suggestions[0].action.is_none());

        for (suggestion, command) in suggestions[1..].iter().zip(COMMANDS.iter()) {
            let act = action(suggestion);
            assert_eq!(act.method, REFINE_METHOD);
            assert_eq!(act.parameters, vec![with_trailing_space(command.subtitle)]);
            assert!(act.parameters[0].ends_with(' '));
        }
    }

    #[test]
    fn direct_connect_strips_prefix() {
        let suggestions = build_suggestions("d   user@host", &ProfileMap::new());

        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].title, "SSH Connect: user@host");
        let act = action(&suggestions[0]);
        assert_eq!(act.method, "do_ssh_connect");
        assert_eq!(act.parameters, vec!["user@host".to_string()]);
    }

    #[test]
    fn profiles_lists_each_stored_profile() {
        let profiles = profile_map(&[("alpha", "a@one"), ("beta", "b@two")]);
        let suggestions = build_suggestions("profiles", &profiles);

        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].title, "Profile: alpha");
        assert_eq!(action(&suggestions[0]).parameters, vec!["a@one".to_string()]);
        assert_eq!(suggestions[1].title, "Profile: beta");
    }

    #[test]
    fn add_with_too_few_tokens_yields_nothing() {
        assert!(build_suggestions("add onlyname", &ProfileMap::new()).is_empty());
    }

    #[test]
    fn add_rejoins_target_tokens() {
        let suggestions = build_suggestions("add web user@host -p 2222", &ProfileMap::new());

        assert_eq!(suggestions.len(), 1);
        let act = action(&suggestions[0]);
        assert_eq!(act.method, "do_add_profile");
        assert_eq!(
            act.parameters,
            vec!["web".to_string(), "user@host -p 2222".to_string()]
        );
    }

    #[test]
    fn remove_lists_profiles_for_deletion() {
        let profiles = profile_map(&[("alpha", "a@one")]);
        let suggestions = build_suggestions("remove", &profiles);

        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].title, "Remove Profile: alpha");
        let act = action(&suggestions[0]);
        assert_eq!(act.method, "do_remove_profile");
        assert_eq!(act.parameters, vec!["alpha".to_string()]);
    }

    #[test]
    fn direct_scp_passes_arguments_verbatim() {
        let suggestions = build_suggestions("scp d notes.txt user@host:/tmp", &ProfileMap::new());

        assert_eq!(suggestions.len(), 1);
        let act = action(&suggestions[0]);
        assert_eq!(act.method, "do_scp_transfer");
        assert_eq!(act.parameters, vec!["notes.txt user@host:/tmp".to_string()]);
    }

    // ---- query classifier: scp profiles sub-cascade ----

    #[test]
    fn scp_profiles_with_empty_rest_refines_per_profile() {
        // Exercised at the rule level: input trimming upstream means the
        // prefix only survives with a name attached.
        let profiles = profile_map(&[("web", "user@web")]);
        let suggestions = rule_profile_scp("scp profiles ", &profiles).unwrap();

        assert_eq!(suggestions.len(), 1);
        let act = action(&suggestions[0]);
        assert_eq!(act.method, REFINE_METHOD);
        assert_eq!(act.parameters, vec!["ssh scp profiles web ".to_string()]);
    }

    #[test]
    fn scp_profiles_exact_match_is_case_insensitive() {
        let profiles = profile_map(&[("Web", "user@web")]);
        let suggestions = build_suggestions("scp profiles web notes.txt /var/tmp", &profiles);

        assert_eq!(suggestions.len(), 1);
        assert_eq!(
            suggestions[0].subtitle,
            "Transfer file to user@web:notes.txt /var/tmp"
        );
        let act = action(&suggestions[0]);
        assert_eq!(act.method, "do_scp_profile_transfer");
        assert_eq!(
            act.parameters,
            vec!["Web".to_string(), "notes.txt /var/tmp".to_string()]
        );
    }

    #[test]
    fn scp_profiles_exact_match_without_remainder_omits_destination() {
        let profiles = profile_map(&[("web", "user@web")]);
        let suggestions = build_suggestions("scp profiles web ", &profiles);

        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].subtitle, "Transfer file to user@web");
        assert_eq!(
            action(&suggestions[0]).parameters,
            vec!["web".to_string(), String::new()]
        );
    }

    #[test]
    fn scp_profiles_near_miss_refines_with_matched_name() {
        let profiles = profile_map(&[("webserver", "user@web")]);
        let suggestions = build_suggestions("scp profiles websrv notes.txt /tmp", &profiles);

        assert_eq!(suggestions.len(), 1);
        let act = action(&suggestions[0]);
        assert_eq!(act.method, REFINE_METHOD);
        assert_eq!(
            act.parameters,
            vec!["ssh scp profiles webserver notes.txt /tmp".to_string()]
        );
    }

    #[test]
    fn scp_profiles_unknown_name_emits_single_notice() {
        let profiles = profile_map(&[("alpha", "a@one")]);
        let suggestions = build_suggestions("scp profiles zzzz notes.txt", &profiles);

        assert_eq!(suggestions.len(), 1);
        assert_eq!(
            suggestions[0].title,
            "SCP to Profile: zzzz (profile not found)"
        );
        let act = action(&suggestions[0]);
        assert!(act.method.is_empty());
        assert!(act.parameters.is_empty());
    }

    // ---- query classifier: fuzzy fallback ----

    #[test]
    fn fallback_expands_list_profiles_hit() {
        let profiles = profile_map(&[("alpha", "a@one"), ("beta", "b@two")]);
        let suggestions = build_suggestions("list", &profiles);

        assert_eq!(suggestions.len(), 2);
        assert!(suggestions
            .iter()
            .all(|s| action(s).method == "do_ssh_connect"));
    }

    #[test]
    fn fallback_expands_remove_profile_hit() {
        let profiles = profile_map(&[("alpha", "a@one")]);
        let suggestions = build_suggestions("delete", &profiles);

        assert!(!suggestions.is_empty());
        assert!(suggestions
            .iter()
            .all(|s| action(s).method == "do_remove_profile"));
    }

    #[test]
    fn fallback_refines_other_command_hits_with_trailing_space() {
        let suggestions = build_suggestions("transfer", &ProfileMap::new());

        assert!(!suggestions.is_empty());
        for suggestion in &suggestions {
            let act = action(suggestion);
            assert_eq!(act.method, REFINE_METHOD);
            assert!(act.parameters[0].ends_with(' '));
        }
    }

    #[test]
    fn free_text_exact_profile_name_appends_connect() {
        let profiles = profile_map(&[("myserver", "user@host")]);
        let suggestions = build_suggestions("MYSERVER", &profiles);

        assert_eq!(suggestions.len(), 1);
        let act = action(&suggestions[0]);
        assert_eq!(act.method, "do_ssh_connect");
        assert_eq!(act.parameters, vec!["user@host".to_string()]);
    }

    #[test]
    fn profile_named_like_command_stays_duplicated() {
        // "list" expands the listing command AND names a profile exactly;
        // both entries are kept, no de-duplication pass exists.
        let profiles = profile_map(&[("list", "user@host")]);
        let suggestions = build_suggestions("list", &profiles);

        assert_eq!(suggestions.len(), 2);
        assert!(suggestions
            .iter()
            .all(|s| action(s).method == "do_ssh_connect"));
    }

    #[test]
    fn unrecognized_gibberish_yields_nothing() {
        assert!(build_suggestions("qqqqqqqq", &ProfileMap::new()).is_empty());
    }

    #[test]
    fn identical_input_and_state_is_deterministic() {
        let profiles = profile_map(&[("zeta", "z@h"), ("alpha", "a@h"), ("mid", "m@h")]);

        let first = serde_json::to_string(&QueryResponse {
            result: build_suggestions("profiles", &profiles),
        })
        .unwrap();
        let second = serde_json::to_string(&QueryResponse {
            result: build_suggestions("profiles", &profiles),
        })
        .unwrap();

        assert_eq!(first, second);
    }

    // ---- fuzzy matcher ----

    #[test]
    fn matcher_tolerates_empty_catalog() {
        let empty: Vec<ProfileRecord> = Vec::new();
        assert!(search_catalog("anything", &empty).is_empty());
    }

    #[test]
    fn matcher_returns_ascending_scores() {
        let hits = search_catalog("profile", &COMMANDS);

        assert!(!hits.is_empty());
        for pair in hits.windows(2) {
            assert!(pair[0].score <= pair[1].score);
        }
        for hit in &hits {
            assert!((0.0..1.0).contains(&hit.score));
        }
    }

    #[test]
    fn matcher_excludes_scores_at_threshold() {
        // "add x" sits exactly at the threshold against the "add" keyword
        // and must not match, so under-specified add input stays empty.
        assert!(search_catalog("add x", &COMMANDS).is_empty());
    }

    #[test]
    fn matcher_rewards_prefix_completions() {
        let hits = search_catalog("dir", &COMMANDS);
        assert!(hits.iter().any(|hit| hit.item.title == "Direct SSH"));
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(normalized_distance("same", "same"), 0.0);
    }

    // ---- profile store ----

    #[test]
    fn store_add_load_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::at(dir.path().join(PROFILES_FILE));

        store.add("foo", "user@host");
        assert_eq!(store.load().get("foo"), Some(&"user@host".to_string()));

        let suggestions = build_suggestions("profiles", &store.load());
        assert_eq!(
            action(&suggestions[0]).parameters,
            vec!["user@host".to_string()]
        );

        store.remove("foo");
        let after = build_suggestions("profiles", &store.load());
        assert!(after.iter().all(|s| {
            !s.title.contains("foo")
                && !s.subtitle.contains("user@host")
                && s.action
                    .as_ref()
                    .map_or(true, |a| a.parameters.iter().all(|p| !p.contains("user@host")))
        }));
    }

    #[test]
    fn store_add_overwrites_instead_of_duplicating() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::at(dir.path().join(PROFILES_FILE));

        store.add("web", "old@host");
        store.add("web", "new@host");
        store.add("db", "db@host");

        let profiles = store.load();
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles.get("web"), Some(&"new@host".to_string()));
    }

    #[test]
    fn store_remove_of_absent_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::at(dir.path().join(PROFILES_FILE));

        store.add("keep", "user@host");
        store.remove("ghost");
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn store_degrades_corrupt_file_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROFILES_FILE);
        fs::write(&path, "not json at all").unwrap();

        let store = ProfileStore::at(path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn store_save_leaves_parseable_pretty_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PROFILES_FILE);
        let store = ProfileStore::at(path.clone());

        store.add("web", "user@host");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains('\n')); // pretty-printed
        let reparsed: ProfileMap = serde_json::from_str(&content).unwrap();
        assert_eq!(reparsed.get("web"), Some(&"user@host".to_string()));
    }

    // ---- action dispatcher ----

    #[test]
    fn scp_profile_command_skips_unknown_profile() {
        let profiles = profile_map(&[("alpha", "a@one")]);
        assert!(scp_profile_command(&profiles, "ghost", "a.txt /tmp").is_none());
    }

    #[test]
    fn scp_profile_command_joins_target_and_destination() {
        let profiles = profile_map(&[("web", "user@host")]);
        let command = scp_profile_command(&profiles, "web", "a.txt /var/tmp").unwrap();

        let line = command.args.last().unwrap();
        assert_eq!(line, "scp a.txt user@host:/var/tmp");
    }

    #[test]
    fn scp_profile_command_drops_tokens_past_the_second() {
        // Documented quirk: only file and destination survive the split.
        let profiles = profile_map(&[("web", "user@host")]);
        let command = scp_profile_command(&profiles, "web", "a.txt /var/tmp extra junk").unwrap();

        let line = command.args.last().unwrap();
        assert_eq!(line, "scp a.txt user@host:/var/tmp");
        assert!(!line.contains("extra"));
    }

    #[test]
    fn connect_command_wraps_target_in_shell_invocation() {
        let command = connect_command("user@host");
        assert!(command.args.last().unwrap().contains("ssh user@host"));
    }

    // ---- wire format ----

    #[test]
    fn header_serializes_without_action_key() {
        let value =
            serde_json::to_value(Suggestion::display("Quick SSH guide", "Available commands:"))
                .unwrap();
        assert!(value.get("JsonRPCAction").is_none());
        assert_eq!(value["IcoPath"], ICON_PATH);
    }

    #[test]
    fn notice_serializes_empty_action() {
        let value = serde_json::to_value(Suggestion::notice("t", "s")).unwrap();
        assert_eq!(value["JsonRPCAction"]["method"], "");
        assert!(value["JsonRPCAction"]["parameters"]
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn invocation_defaults_missing_parameters() {
        let invocation: Invocation = serde_json::from_str(r#"{"method":"query"}"#).unwrap();
        assert_eq!(invocation.method, "query");
        assert!(invocation.parameters.is_empty());
    }
}
