use chrono::Utc;
use std::fs;
use std::io;
use std::path::PathBuf;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

const CSV_HEADER: &str = "timestamp,teamName,score,playerId\n";

/// Append-only ranking log: one CSV row per registered team score. The file
/// is the whole store; nothing is ever rewritten or deleted.
pub struct RankingStore {
    csv_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankingRecord {
    pub timestamp: i64,
    pub team_name: String,
    pub score: u32,
    pub player_id: String,
}

impl RankingStore {
    /// Creates the data directory and the header row when missing.
    pub fn new(csv_path: impl Into<PathBuf>) -> io::Result<Self> {
        let csv_path = csv_path.into();
        if let Some(parent) = csv_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !csv_path.exists() {
            fs::write(&csv_path, CSV_HEADER)?;
            println!("[RANK] created ranking csv at {}", csv_path.display());
        }
        Ok(RankingStore { csv_path })
    }

    /// Appends one record. Failures surface to the caller so the requesting
    /// client can be told; room state is never involved.
    pub async fn append(&self, team_name: &str, score: u32, player_id: &str) -> io::Result<()> {
        let row = format!(
            "{},\"{}\",\"{}\",\"{}\"\n",
            Utc::now().timestamp_millis(),
            team_name.replace('"', "\"\""),
            score,
            player_id
        );
        let mut file = async_fs::OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .await?;
        file.write_all(row.as_bytes()).await?;
        Ok(())
    }

    /// Reads every data row back out, skipping the header and any row that
    /// does not parse.
    pub async fn load(&self) -> io::Result<Vec<RankingRecord>> {
        let content = async_fs::read_to_string(&self.csv_path).await?;
        Ok(content
            .lines()
            .skip(1)
            .filter_map(parse_row)
            .collect())
    }
}

fn parse_row(line: &str) -> Option<RankingRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (timestamp, rest) = line.split_once(',')?;
    let timestamp = timestamp.parse::<i64>().ok()?;
    let mut fields = parse_quoted_fields(rest)?;
    if fields.len() != 3 {
        return None;
    }
    let player_id = fields.pop()?;
    let score = fields.pop()?.parse::<u32>().ok()?;
    let team_name = fields.pop()?;
    Some(RankingRecord {
        timestamp,
        team_name,
        score,
        player_id,
    })
}

/// Splits `"a","b","c"` into its unescaped fields (doubled quotes collapse).
fn parse_quoted_fields(raw: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut chars = raw.chars().peekable();
    loop {
        if chars.next()? != '"' {
            return None;
        }
        let mut field = String::new();
        loop {
            match chars.next()? {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        break;
                    }
                }
                c => field.push(c),
            }
        }
        fields.push(field);
        match chars.next() {
            None => return Some(fields),
            Some(',') => continue,
            Some(_) => return None,
        }
    }
}
