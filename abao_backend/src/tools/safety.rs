//! Guards around tool execution: parameter sanity, destructive shell
//! commands, secret leaks in output, and delimiting untrusted output.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

/// Characters of tool output fed back to the model.
const MAX_OUTPUT_CHARS: usize = 50_000;

const MAX_JSON_DEPTH: usize = 10;
const MAX_PARAM_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Allow,
    Block(String),
}

pub fn validate_input(params: &Value) -> SafetyVerdict {
    if json_depth(params) > MAX_JSON_DEPTH {
        return SafetyVerdict::Block(format!(
            "Parameter nesting depth exceeds maximum of {}",
            MAX_JSON_DEPTH
        ));
    }

    if let Some(large) = find_large_strings(params, MAX_PARAM_BYTES) {
        return SafetyVerdict::Block(format!(
            "Parameter '{}' contains string value exceeding 1MB",
            large
        ));
    }

    SafetyVerdict::Allow
}

const DESTRUCTIVE_COMMANDS: &[(&str, &str)] = &[
    (r"(?i)\brm\s+-\S*r\S*f", "rm -rf"),
    (r"(?i)\brm\s+-\S*f\S*r", "rm -fr"),
    (r"(?i)\bdd\s+if=", "dd if="),
    (r"(?i)\bmkfs\b", "mkfs"),
    (r"(?i)\bformat\b", "format"),
    (r">\s*/dev/", "write to /dev"),
    (r"(?i)\bshutdown\b", "shutdown"),
    (r"(?i)\breboot\b", "reboot"),
    (r"(?i)\bkill\s+-9\s+1\b", "kill -9 1"),
    (r"(?i)\bchmod\s+777\s+/", "chmod 777 /"),
    (r"(?i)\bcurl\b.*\|\s*bash\b", "curl | bash"),
    (r"(?i)\bwget\b.*\|\s*bash\b", "wget | bash"),
];

fn command_denylist() -> &'static [(Regex, &'static str)] {
    static DENYLIST: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    DENYLIST.get_or_init(|| {
        DESTRUCTIVE_COMMANDS
            .iter()
            .filter_map(|(pattern, label)| match Regex::new(pattern) {
                Ok(re) => Some((re, *label)),
                Err(error) => {
                    tracing::error!("Invalid denylist pattern {:?}: {}", pattern, error);
                    None
                }
            })
            .collect()
    })
}

/// Shell commands matching the destructive denylist are refused outright.
pub fn check_command(command: &str) -> SafetyVerdict {
    for (re, label) in command_denylist() {
        if re.is_match(command) {
            let preview: String = command.chars().take(80).collect();
            return SafetyVerdict::Block(format!("Blocked dangerous command ({}): {}", label, preview));
        }
    }
    SafetyVerdict::Allow
}

/// Scan output for credentials before it reaches the model.
pub fn detect_leaks(text: &str) -> SafetyVerdict {
    let patterns = [
        ("sk-[a-zA-Z0-9]{20,}", "API key"),
        ("ghp_[a-zA-Z0-9]{36}", "GitHub personal access token"),
        ("gho_[a-zA-Z0-9]{36}", "GitHub OAuth token"),
        ("glpat-[a-zA-Z0-9\\-]{20,}", "GitLab personal access token"),
        (
            "-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
            "Private key",
        ),
        ("AKIA[0-9A-Z]{16}", "AWS access key"),
        ("eyJ[a-zA-Z0-9_-]{10,}\\.eyJ[a-zA-Z0-9_-]{10,}", "JWT token"),
    ];

    for (pattern, description) in &patterns {
        if let Ok(re) = Regex::new(pattern) {
            if re.is_match(text) {
                return SafetyVerdict::Block(format!(
                    "Potential {} detected in output, withheld",
                    description
                ));
            }
        }
    }

    SafetyVerdict::Allow
}

/// Truncate and wrap output so it reads as data, not instructions.
pub fn sanitize_output(tool_name: &str, output: &str) -> String {
    let total = output.chars().count();
    let body = if total > MAX_OUTPUT_CHARS {
        let head: String = output.chars().take(MAX_OUTPUT_CHARS).collect();
        format!(
            "{}\n\n[OUTPUT TRUNCATED: showing first {} of {} characters]",
            head, MAX_OUTPUT_CHARS, total
        )
    } else {
        output.to_string()
    };

    format!(
        "<tool_output name=\"{}\">\n{}\n</tool_output>",
        xml_escape(tool_name),
        body
    )
}

/// Leak check, then sanitize. `Err` carries the block reason.
pub fn check_output(tool_name: &str, output: &str) -> Result<String, String> {
    if let SafetyVerdict::Block(reason) = detect_leaks(output) {
        tracing::warn!(
            "Safety blocked output from tool '{}': {}",
            tool_name,
            reason
        );
        return Err(reason);
    }
    Ok(sanitize_output(tool_name, output))
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(arr) => 1 + arr.iter().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}

fn find_large_strings(value: &Value, max_len: usize) -> Option<String> {
    match value {
        Value::String(s) if s.len() > max_len => Some("(root)".to_string()),
        Value::Object(map) => {
            for (key, val) in map {
                if let Value::String(s) = val {
                    if s.len() > max_len {
                        return Some(key.clone());
                    }
                }
                if let Some(found) = find_large_strings(val, max_len) {
                    return Some(format!("{}.{}", key, found));
                }
            }
            None
        }
        Value::Array(arr) => {
            for (i, val) in arr.iter().enumerate() {
                if let Some(found) = find_large_strings(val, max_len) {
                    return Some(format!("[{}].{}", i, found));
                }
            }
            None
        }
        _ => None,
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
