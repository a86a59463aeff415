//! Command validation
//!
//! Pure and synchronous. A candidate passes only if it is short enough,
//! free of shell metacharacters, under the risk ceiling, clear of every
//! blacklist pattern, tokenizes cleanly and starts with a whitelisted prefix.

use crate::config::SecurityConfig;
use crate::decision::{CandidateAction, CandidateSource};
use regex::Regex;
use serde::Serialize;

/// Outcome of validating one candidate. Only `CommandPolicy` builds these,
/// so holding an allowed verdict proves the command went through the checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationVerdict {
    allowed: bool,
    reason: String,
    sanitized_command: String,
    cycle: u64,
    risk_score: f64,
    source: CandidateSource,
}

impl ValidationVerdict {
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn sanitized_command(&self) -> &str {
        &self.sanitized_command
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn risk_score(&self) -> f64 {
        self.risk_score
    }

    pub fn source(&self) -> CandidateSource {
        self.source
    }
}

pub struct CommandPolicy {
    /// Whitelisted prefixes, pre-split into tokens
    whitelist: Vec<Vec<String>>,
    blacklist: Vec<Regex>,
    max_command_length: usize,
    forbidden_chars: Vec<char>,
    risk_ceiling: f64,
}

impl CommandPolicy {
    pub fn from_config(config: &SecurityConfig) -> Result<Self, regex::Error> {
        let blacklist = config
            .blacklist
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        let whitelist = config
            .whitelist
            .iter()
            .map(|prefix| prefix.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|tokens| !tokens.is_empty())
            .collect();

        Ok(Self {
            whitelist,
            blacklist,
            max_command_length: config.max_command_length,
            forbidden_chars: config.forbidden_chars.chars().collect(),
            risk_ceiling: config.risk_ceiling,
        })
    }

    pub fn validate(&self, candidate: &CandidateAction, cycle: u64) -> ValidationVerdict {
        let raw = candidate.command.as_str();
        let sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let verdict = |allowed: bool, reason: String| ValidationVerdict {
            allowed,
            reason,
            sanitized_command: sanitized.clone(),
            cycle,
            risk_score: candidate.risk_score,
            source: candidate.source,
        };

        if sanitized.is_empty() {
            return verdict(false, "empty command".into());
        }
        if raw.chars().count() > self.max_command_length {
            return verdict(
                false,
                format!("command exceeds {} characters", self.max_command_length),
            );
        }
        if let Some(c) = raw.chars().find(|c| self.forbidden_chars.contains(c)) {
            return verdict(false, format!("forbidden character {c:?}"));
        }
        if let Some(c) = raw.chars().find(|c| c.is_control() && *c != ' ' && *c != '\t') {
            return verdict(false, format!("control character {:#x}", c as u32));
        }

        if !candidate.risk_score.is_finite() || candidate.risk_score > self.risk_ceiling {
            return verdict(
                false,
                format!(
                    "risk score {:.2} above ceiling {:.2}, requires human review",
                    candidate.risk_score, self.risk_ceiling
                ),
            );
        }

        let lowered = sanitized.to_lowercase();
        if let Some(pattern) = self.blacklist.iter().find(|re| re.is_match(&lowered)) {
            return verdict(false, format!("matches blacklist pattern {}", pattern.as_str()));
        }

        let tokens = match shell_words::split(&sanitized) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => return verdict(false, "empty command".into()),
            Err(e) => return verdict(false, format!("does not tokenize: {e}")),
        };

        let whitelisted = self
            .whitelist
            .iter()
            .any(|prefix| tokens.len() >= prefix.len() && tokens.iter().zip(prefix).all(|(t, p)| t == p));
        if !whitelisted {
            return verdict(false, format!("{} is not a whitelisted command", tokens[0]));
        }

        verdict(true, "passed command policy".into())
    }
}
