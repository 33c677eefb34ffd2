//! Remote search over exec channels
//!
//! Translates a [`SearchRequest`] into one grep or find invocation covering
//! every root, streams the output line by line, and enriches a bounded
//! number of matched paths with file metadata. Cancellation resolves with
//! whatever was collected and kills the remote process so no grep keeps
//! running server-side after the caller gave up.

use russh::{ChannelMsg, Sig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::shell::{shell_quote, shell_quote_all};
use crate::config::CoreConfig;
use crate::error::Error;
use crate::events::CancelToken;
use crate::sftp::SftpChannel;
use crate::ssh::HandleController;

/// What the pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchKind {
    /// Match file contents, reporting path, line number, and line text.
    Content,
    /// Match file names, reporting paths only.
    FileName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Remote directories to search. All roots go into a single remote
    /// invocation, so N roots still cost one round-trip.
    pub roots: Vec<String>,
    pub pattern: String,
    pub kind: SearchKind,
    pub case_sensitive: bool,
    /// Treat the pattern as an extended regex instead of a literal.
    /// Ignored for filename search, which is always a glob.
    pub regex: bool,
    /// Basename globs a file must match to be considered.
    pub include: Vec<String>,
    /// Globs excluded both as file names and as directory names.
    pub exclude: Vec<String>,
    /// Per-request result cap; 0 falls back to the configured cap (which
    /// itself may be 0, meaning unlimited).
    pub max_results: usize,
}

impl SearchRequest {
    pub fn content(roots: Vec<String>, pattern: impl Into<String>) -> Self {
        Self::new(roots, pattern, SearchKind::Content)
    }

    pub fn filenames(roots: Vec<String>, pattern: impl Into<String>) -> Self {
        Self::new(roots, pattern, SearchKind::FileName)
    }

    fn new(roots: Vec<String>, pattern: impl Into<String>, kind: SearchKind) -> Self {
        Self {
            roots,
            pattern: pattern.into(),
            kind,
            case_sensitive: false,
            regex: false,
            include: Vec::new(),
            exclude: Vec::new(),
            max_results: 0,
        }
    }
}

/// One search hit. `line` and `text` are set for content matches only;
/// the metadata fields are filled by best-effort enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: Option<u64>,
    pub text: Option<String>,
    pub size: Option<u64>,
    pub modified: Option<i64>,
    pub permissions: Option<String>,
}

impl SearchMatch {
    fn content(path: String, line: u64, text: String) -> Self {
        Self {
            path,
            line: Some(line),
            text: Some(text),
            size: None,
            modified: None,
            permissions: None,
        }
    }

    fn filename(path: String) -> Self {
        Self {
            path,
            line: None,
            text: None,
            size: None,
            modified: None,
            permissions: None,
        }
    }
}

pub struct RemoteSearchEngine {
    controller: HandleController,
    sftp: Arc<SftpChannel>,
    config: Arc<CoreConfig>,
}

impl RemoteSearchEngine {
    pub fn new(
        controller: HandleController,
        sftp: Arc<SftpChannel>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            controller,
            sftp,
            config,
        }
    }

    /// Run a search. A cancelled search resolves with the matches collected
    /// so far (possibly none) rather than an error.
    pub async fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchMatch>, Error> {
        if request.roots.is_empty() {
            return Err(Error::Protocol("search requires at least one root".into()));
        }
        if request.pattern.is_empty() {
            debug!("Empty search pattern, returning no matches");
            return Ok(Vec::new());
        }
        if request.regex {
            // Fast local rejection of malformed patterns. The remote grep
            // dialect has the final say on anything that parses here.
            regex::Regex::new(&request.pattern)
                .map_err(|e| Error::Protocol(format!("invalid regex pattern: {}", e)))?;
        }
        for filter in request.include.iter().chain(request.exclude.iter()) {
            glob::Pattern::new(filter).map_err(|e| {
                Error::Protocol(format!("invalid filter glob '{}': {}", filter, e))
            })?;
        }

        let cap = if request.max_results > 0 {
            request.max_results
        } else {
            self.config.search_result_cap
        };

        let command = match request.kind {
            SearchKind::Content => build_content_command(request, cap),
            SearchKind::FileName => build_filename_command(request, cap),
        };
        debug!("Remote search: {}", command);

        let (mut matches, cancelled) = self.run_remote(&command, request.kind, cap, cancel).await?;

        matches.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));

        if cancelled {
            debug!("Search cancelled with {} partial matches", matches.len());
            return Ok(matches);
        }

        self.enrich(&mut matches).await;
        debug!("Search complete: {} matches", matches.len());
        Ok(matches)
    }

    /// Execute the search command and stream-parse its stdout.
    async fn run_remote(
        &self,
        command: &str,
        kind: SearchKind,
        cap: usize,
        cancel: &CancelToken,
    ) -> Result<(Vec<SearchMatch>, bool), Error> {
        let mut channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Channel(format!("failed to start remote search: {}", e)))?;

        let mut pending: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut matches: Vec<SearchMatch> = Vec::new();
        let mut exit_code: Option<u32> = None;
        let mut cancelled = false;

        'read: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Kill the remote process; leaking a grep per cancelled
                    // search would pile up server-side.
                    let _ = channel.signal(Sig::KILL).await;
                    let _ = channel.close().await;
                    cancelled = true;
                    break 'read;
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        pending.extend_from_slice(&data);
                        for line in drain_lines(&mut pending) {
                            if let Some(m) = parse_line(kind, &line) {
                                matches.push(m);
                            }
                            if cap > 0 && matches.len() >= cap {
                                let _ = channel.signal(Sig::KILL).await;
                                let _ = channel.close().await;
                                break 'read;
                            }
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break 'read,
                    Some(_) => {}
                }
            }
        }

        if !cancelled && !pending.is_empty() {
            let tail = String::from_utf8_lossy(&pending).trim_end().to_string();
            if let Some(m) = parse_line(kind, &tail) {
                matches.push(m);
            }
        }

        // grep exits 1 for "no matches" and the trailing head absorbs
        // SIGPIPE exits, so only treat hard failures with nothing to show
        // as errors (e.g. 127 when the tool is missing).
        if let Some(code) = exit_code {
            if code > 1 && matches.is_empty() && !cancelled {
                let stderr_str = String::from_utf8_lossy(&stderr).trim().to_string();
                warn!("Remote search failed: exit={} stderr={}", code, stderr_str);
                return Err(Error::Exec {
                    command: command.to_string(),
                    exit_code: Some(code),
                    stderr: stderr_str,
                });
            }
        }

        Ok((matches, cancelled))
    }

    /// Fill size/mtime/permissions for a bounded number of unique matched
    /// paths. Per-path failures are logged and skipped, never fatal.
    async fn enrich(&self, matches: &mut [SearchMatch]) {
        let cap = self.config.search_max_stat_count;
        if cap == 0 || matches.is_empty() {
            return;
        }

        let mut seen = HashSet::new();
        let mut unique: Vec<String> = Vec::new();
        for m in matches.iter() {
            if seen.insert(m.path.clone()) {
                unique.push(m.path.clone());
                if unique.len() >= cap {
                    break;
                }
            }
        }

        let mut meta = std::collections::HashMap::new();
        for path in unique {
            match self.sftp.stat(&path).await {
                Ok(info) => {
                    meta.insert(path, (info.size, info.modified, info.permissions));
                }
                Err(e) => debug!("Search enrichment stat failed for {}: {}", path, e),
            }
        }

        for m in matches.iter_mut() {
            if let Some((size, modified, permissions)) = meta.get(&m.path) {
                m.size = Some(*size);
                m.modified = Some(*modified);
                m.permissions = Some(permissions.clone());
            }
        }
    }
}

/// Build the grep invocation for a content search.
///
/// Shape: `grep -rHn [-i] (-E|-F) [filters] -e <pattern> <roots> 2>/dev/null [| head -n N]`
fn build_content_command(request: &SearchRequest, cap: usize) -> String {
    let mut cmd = String::from("grep -rHn");
    if !request.case_sensitive {
        cmd.push_str(" -i");
    }
    cmd.push_str(if request.regex { " -E" } else { " -F" });

    for glob in &request.include {
        cmd.push_str(" --include=");
        cmd.push_str(&shell_quote(glob));
    }
    for glob in &request.exclude {
        cmd.push_str(" --exclude=");
        cmd.push_str(&shell_quote(glob));
        cmd.push_str(" --exclude-dir=");
        cmd.push_str(&shell_quote(glob));
    }

    cmd.push_str(" -e ");
    cmd.push_str(&shell_quote(&request.pattern));
    cmd.push(' ');
    cmd.push_str(&shell_quote_all(&request.roots));
    cmd.push_str(" 2>/dev/null");

    if cap > 0 {
        cmd.push_str(&format!(" | head -n {}", cap));
    }
    cmd
}

/// Build the find invocation for a filename search.
///
/// A pattern without glob metacharacters becomes a `*pattern*` substring
/// match, mirroring what callers expect from an editor quick-open box.
fn build_filename_command(request: &SearchRequest, cap: usize) -> String {
    let glob = if request.pattern.contains(['*', '?', '[']) {
        request.pattern.clone()
    } else {
        format!("*{}*", request.pattern)
    };

    let mut cmd = format!("find {} -type f", shell_quote_all(&request.roots));

    for exclude in &request.exclude {
        cmd.push_str(" ! -name ");
        cmd.push_str(&shell_quote(exclude));
        cmd.push_str(" ! -path ");
        cmd.push_str(&shell_quote(&format!("*/{}/*", exclude)));
    }

    if !request.include.is_empty() {
        cmd.push_str(" \\( ");
        let clauses: Vec<String> = request
            .include
            .iter()
            .map(|g| format!("-name {}", shell_quote(g)))
            .collect();
        cmd.push_str(&clauses.join(" -o "));
        cmd.push_str(" \\)");
    }

    let name_flag = if request.case_sensitive {
        "-name"
    } else {
        "-iname"
    };
    cmd.push_str(&format!(" {} {}", name_flag, shell_quote(&glob)));
    cmd.push_str(" 2>/dev/null");

    if cap > 0 {
        cmd.push_str(&format!(" | head -n {}", cap));
    }
    cmd
}

/// Pull complete lines out of the pending byte buffer, leaving any trailing
/// partial line in place for the next data frame.
fn drain_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = pending.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        lines.push(line.trim_end_matches('\r').to_string());
    }
    lines
}

fn parse_line(kind: SearchKind, line: &str) -> Option<SearchMatch> {
    match kind {
        SearchKind::Content => parse_content_line(line),
        SearchKind::FileName => {
            let path = line.trim();
            if path.is_empty() {
                None
            } else {
                Some(SearchMatch::filename(path.to_string()))
            }
        }
    }
}

/// Parse one `path:line:text` grep output line. Lines that do not fit the
/// grammar (binary-file notices, stray output) are dropped.
fn parse_content_line(line: &str) -> Option<SearchMatch> {
    let mut parts = line.splitn(3, ':');
    let path = parts.next()?;
    let line_no = parts.next()?.parse::<u64>().ok()?;
    let text = parts.next().unwrap_or("");
    if path.is_empty() {
        return None;
    }
    Some(SearchMatch::content(
        path.to_string(),
        line_no,
        text.to_string(),
    ))
}
