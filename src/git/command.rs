//! Parsing of the command line carried by an SSH `exec` request.
//!
//! Git clients send lines such as:
//!
//! ```text
//! git-upload-pack '/org/repo.git'
//! git receive-pack 'it'\''s.git'
//! ```
//!
//! The grammar accepted here:
//!
//! * leading whitespace, `'` and `(` are ignored;
//! * the verb is one word (`git-upload-pack`) or the compound `git <word>`;
//! * whitespace separates the verb from exactly one argument;
//! * the argument is a shell-style word built from `'...'` (literal),
//!   `"..."` (literal, with `\"` and `\\` escapes), `\c` (escaped char) and
//!   bare non-whitespace characters;
//! * only whitespace may follow the argument.
//!
//! Everything here is pure: no I/O, identical input gives identical output.

use super::verbs::{AccessMode, AllowedVerbs};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("not a git command")]
    NotGit,
    #[error("missing repository argument")]
    MissingArgument,
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),
    #[error("dangling escape at end of command")]
    DanglingEscape,
    #[error("unexpected input after repository argument: {0:?}")]
    TrailingInput(String),
    #[error("control character in command")]
    ControlCharacter,
    #[error("command not allowed: {0:?}")]
    UnknownVerb(String),
}

/// A validated exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommand {
    /// Verb as sent by the client; may be the compound `git <word>` form.
    pub verb: String,
    /// Unquoted repository argument, not yet resolved to a path.
    pub argument: String,
    pub mode: AccessMode,
}

impl GitCommand {
    /// Split `raw` into verb and argument and check the verb against the
    /// allowed set.
    pub fn parse(raw: &str, verbs: &AllowedVerbs) -> Result<Self, CommandError> {
        let (verb, argument) = split_command(raw)?;
        let mode = verbs
            .lookup(&verb)
            .ok_or_else(|| CommandError::UnknownVerb(verb.clone()))?;
        Ok(Self {
            verb,
            argument,
            mode,
        })
    }
}

/// Return the payload from its first `git` onwards.
///
/// Clients occasionally wrap the command (`sh -c "git-upload-pack ..."`); the
/// wrapper is discarded.  `None` when the payload never mentions `git`.
pub fn locate_git(payload: &str) -> Option<&str> {
    payload.find("git").map(|start| &payload[start..])
}

/// Split a command line into `(verb, argument)` without validating the verb.
pub fn split_command(raw: &str) -> Result<(String, String), CommandError> {
    let text = raw
        .trim_start_matches(|c: char| c == '\'' || c == '(' || c.is_whitespace())
        .trim_end();
    if text.chars().any(|c| c.is_control() && c != '\t') {
        return Err(CommandError::ControlCharacter);
    }

    let (head, rest) = text
        .split_once(char::is_whitespace)
        .ok_or(CommandError::MissingArgument)?;
    let (verb, rest) = if head == "git" {
        let (sub, rest) = rest
            .trim_start()
            .split_once(char::is_whitespace)
            .ok_or(CommandError::MissingArgument)?;
        (format!("git {sub}"), rest)
    } else {
        (head.to_string(), rest)
    };

    let (argument, remainder) = parse_word(rest.trim_start())?;
    let remainder = remainder.trim();
    if !remainder.is_empty() {
        return Err(CommandError::TrailingInput(remainder.to_string()));
    }
    if argument.is_empty() {
        return Err(CommandError::MissingArgument);
    }
    Ok((verb, argument))
}

/// Read one shell-style word from the front of `input`, returning it along
/// with the unconsumed remainder.
fn parse_word(input: &str) -> Result<(String, &str), CommandError> {
    let mut word = String::new();
    let mut chars = input.char_indices();

    while let Some((index, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => return Ok((word, &input[index..])),
            '\'' => loop {
                match chars.next() {
                    Some((_, '\'')) => break,
                    Some((_, c)) => word.push(c),
                    None => return Err(CommandError::UnterminatedQuote('\'')),
                }
            },
            '"' => loop {
                match chars.next() {
                    Some((_, '"')) => break,
                    Some((_, '\\')) => match chars.next() {
                        Some((_, c @ ('"' | '\\'))) => word.push(c),
                        Some((_, c)) => {
                            word.push('\\');
                            word.push(c);
                        }
                        None => return Err(CommandError::UnterminatedQuote('"')),
                    },
                    Some((_, c)) => word.push(c),
                    None => return Err(CommandError::UnterminatedQuote('"')),
                }
            },
            '\\' => match chars.next() {
                Some((_, c)) => word.push(c),
                None => return Err(CommandError::DanglingEscape),
            },
            c => word.push(c),
        }
    }

    Ok((word, ""))
}
