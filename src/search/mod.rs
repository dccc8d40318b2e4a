use serde::Serialize;

use crate::error::Result;
use crate::storage::Database;

/// A single search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub natural_id: String,
    pub name: String,
    pub owner: Option<String>,
    pub address: Option<String>,
    /// Highlighted snippet from the matching text.
    pub snippet: String,
    /// FTS5 rank score (lower = more relevant). Zero for substring matches.
    pub rank: f64,
}

/// Options controlling a search operation.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Maximum number of results to return.
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Search results container.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub total: usize,
}

/// Turn free text into an FTS5 query: every term quoted, prefix-matched and
/// AND-ed. Terms without a letter or digit are dropped, since the tokenizer
/// would discard them. Returns `None` when nothing searchable remains.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(|t| format!("\"{t}\"*"))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

/// Substring pattern for `LIKE ... ESCAPE '\'`, with wildcards in the
/// query matched literally.
fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Search live companies by name, owner or address.
///
/// Uses the FTS index first and falls back to a substring scan only when
/// the index has no match at all (FTS5 tokenizes CJK text as whole runs).
/// An empty query lists companies by name.
pub async fn search(db: &Database, query: &str, options: &SearchOptions) -> Result<SearchResults> {
    let query_owned = query.trim().to_string();
    let limit = options.limit.unwrap_or(50);
    let offset = options.offset.unwrap_or(0);

    let hits = db
        .reader()
        .call(move |conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<SearchHit> {
                let snippet: Option<String> = row.get(4)?;
                Ok(SearchHit {
                    natural_id: row.get(0)?,
                    name: row.get(1)?,
                    owner: row.get(2)?,
                    address: row.get(3)?,
                    snippet: snippet.unwrap_or_default(),
                    rank: row.get(5)?,
                })
            };

            if query_owned.is_empty() {
                let mut stmt = conn.prepare(
                    "SELECT natural_id, company_name, owner, address, NULL, 0.0
                     FROM companies WHERE sync_state != 'deleted'
                     ORDER BY company_name, natural_id LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![limit, offset], map_row)?;
                return rows.collect::<rusqlite::Result<Vec<_>>>();
            }

            if let Some(fts) = fts_query(&query_owned) {
                let matched: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM companies_fts
                     JOIN companies c ON c.id = companies_fts.rowid
                     WHERE companies_fts MATCH ?1 AND c.sync_state != 'deleted'",
                    rusqlite::params![fts],
                    |row| row.get(0),
                )?;
                if matched > 0 {
                    let mut stmt = conn.prepare(
                        "SELECT c.natural_id, c.company_name, c.owner, c.address,
                                snippet(companies_fts, -1, '<b>', '</b>', '...', 16), companies_fts.rank
                         FROM companies_fts
                         JOIN companies c ON c.id = companies_fts.rowid
                         WHERE companies_fts MATCH ?1 AND c.sync_state != 'deleted'
                         ORDER BY rank LIMIT ?2 OFFSET ?3",
                    )?;
                    let rows = stmt.query_map(rusqlite::params![fts, limit, offset], map_row)?;
                    return rows.collect::<rusqlite::Result<Vec<_>>>();
                }
            }

            let pattern = like_pattern(&query_owned);
            let mut stmt = conn.prepare(
                "SELECT natural_id, company_name, owner, address, company_name, 0.0
                 FROM companies
                 WHERE sync_state != 'deleted'
                   AND (company_name LIKE ?1 ESCAPE '\\'
                        OR owner LIKE ?1 ESCAPE '\\'
                        OR address LIKE ?1 ESCAPE '\\')
                 ORDER BY company_name, natural_id LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![pattern, limit, offset], map_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

    let total = hits.len();
    Ok(SearchResults {
        query: query.to_string(),
        hits,
        total,
    })
}
