use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use tracing::{debug, instrument};

use crate::command::server::auth::UserIdentity;
use crate::command::server::error::Error;

/// Loads a static token file, see [`parse_token_records`] for the format.
#[instrument]
pub fn load_token_file(path: &Path) -> Result<HashMap<String, UserIdentity>, Error> {
    let file = File::open(path).map_err(|error| {
        let msg = format!("failed to open token auth file {}: {error}", path.display());
        Error::Initialization(msg)
    })?;

    let table = parse_token_records(BufReader::new(file))?;
    debug!("Loaded {} static tokens", table.len());
    Ok(table)
}

/// Parses CSV records of the form `token,user,uid[,"group1,group2"]`.
///
/// Tokens are unique, a user may own several tokens. Record numbers in
/// errors are 1-based and count records, not physical lines.
pub fn parse_token_records<R: Read>(reader: R) -> Result<HashMap<String, UserIdentity>, Error> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut table = HashMap::new();

    for (index, record) in reader.records().enumerate() {
        let line = index + 1;
        let record = record.map_err(|error| {
            Error::Initialization(format!("failed to parse token auth file: {error}"))
        })?;

        if record.len() < 3 || record.len() > 4 {
            return Err(malformed(line, "is ill formatted"));
        }

        let token = record[0].trim();
        if token.is_empty() {
            return Err(malformed(line, "has empty token"));
        }
        if table.contains_key(token) {
            return Err(malformed(line, "reuses token"));
        }

        let username = record[1].trim();
        if username.is_empty() {
            return Err(malformed(line, "has empty user name"));
        }

        let uid = record[2].trim();
        if uid.is_empty() {
            return Err(malformed(line, "has empty uid"));
        }

        let groups = record.get(3).map(parse_groups).unwrap_or_default();

        table.insert(
            token.to_string(),
            UserIdentity {
                username: username.to_string(),
                uid: uid.to_string(),
                groups,
            },
        );
    }

    Ok(table)
}

fn malformed(line: usize, problem: &str) -> Error {
    Error::Initialization(format!("line #{line} of token auth file {problem}"))
}

fn parse_groups(field: &str) -> Vec<String> {
    field
        .split(',')
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .map(String::from)
        .collect()
}
