use std::collections::HashMap;
use std::io::Read;

use anyhow::{Context, Result};
use csv::ReaderBuilder;

/// The Library of Congress table of ISO639-2 / ISO639-1 language codes.
/// OSM tags of the form `name:en`, `name:fra` etc. use these codes.
pub const ISO_639_2_URL: &str = "http://www.loc.gov/standards/iso639-2/ISO-639-2_utf-8.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageCodes {
    pub three_letter: Option<String>,
    pub two_letter: Option<String>,
    pub english_name: Option<String>,
    pub french_name: Option<String>,
}

/// Blank fields (including all-whitespace ones) become an explicit
/// absent marker rather than an empty string.
fn make_missing_none(field: &str) -> Option<String> {
    if field.trim().is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

/// Fetches and parses the pipe-delimited language code table. Any
/// network or parse failure aborts the whole import: this runs once per
/// invocation, before any database writes.
pub fn fetch_language_table(url: &str) -> Result<Vec<LanguageCodes>> {
    let response = reqwest::blocking::Client::new()
        .get(url)
        .header(reqwest::header::USER_AGENT, "Mozilla/5.0")
        .send()
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("failed to fetch language code table from {}", url))?;
    read_language_table(response)
}

/// Streams and decodes the table row by row. Each source row yields one
/// entry keyed by the bibliographic three-letter code and, when a
/// distinct terminologic code is present, a second entry keyed by that
/// code sharing the same two-letter code and names.
pub fn read_language_table(reader: impl Read) -> Result<Vec<LanguageCodes>> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(b'|')
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut result = Vec::new();
    for record in csv_reader.records() {
        let record = record.context("failed to read language code table row")?;
        let field = |i: usize| record.get(i).unwrap_or("");
        let bibliographic = LanguageCodes {
            three_letter: make_missing_none(field(0)),
            two_letter: make_missing_none(field(2)),
            english_name: make_missing_none(field(3)),
            french_name: make_missing_none(field(4)),
        };
        let terminologic = make_missing_none(field(1));
        result.push(bibliographic.clone());
        if let Some(terminologic) = terminologic {
            result.push(LanguageCodes { three_letter: Some(terminologic), ..bibliographic });
        }
    }
    Ok(result)
}

/// Indexes the table on both two-letter and three-letter codes, keeping
/// only rows with an English name. Later rows win on duplicate codes;
/// the source data has none in practice.
pub fn language_lookup(rows: &[LanguageCodes]) -> HashMap<String, String> {
    let mut lookup = HashMap::new();
    for row in rows {
        let english_name = match &row.english_name {
            Some(name) => name,
            None => continue,
        };
        for code in [&row.two_letter, &row.three_letter].into_iter().flatten() {
            lookup.insert(code.clone(), english_name.clone());
        }
    }
    lookup
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
aar||aa|Afar|afar
alb|sqi|sq|Albanian|albanais
mis|||Uncoded languages|langues non codées
fre|fra|fr|French|français
";

    #[test]
    fn bibliographic_rows_parse() {
        let table = read_language_table(SAMPLE.as_bytes()).unwrap();
        assert_eq!(
            table[0],
            LanguageCodes {
                three_letter: Some("aar".to_string()),
                two_letter: Some("aa".to_string()),
                english_name: Some("Afar".to_string()),
                french_name: Some("afar".to_string()),
            }
        );
    }

    #[test]
    fn terminologic_code_yields_a_second_entry() {
        let table = read_language_table(SAMPLE.as_bytes()).unwrap();
        let albanian: Vec<&LanguageCodes> = table
            .iter()
            .filter(|row| row.english_name.as_deref() == Some("Albanian"))
            .collect();
        assert_eq!(albanian.len(), 2);
        assert_eq!(albanian[0].three_letter.as_deref(), Some("alb"));
        assert_eq!(albanian[1].three_letter.as_deref(), Some("sqi"));
        assert_eq!(albanian[1].two_letter.as_deref(), Some("sq"));
    }

    #[test]
    fn blank_fields_become_none() {
        let table = read_language_table(SAMPLE.as_bytes()).unwrap();
        let uncoded = table
            .iter()
            .find(|row| row.three_letter.as_deref() == Some("mis"))
            .unwrap();
        assert_eq!(uncoded.two_letter, None);
        assert_eq!(uncoded.english_name.as_deref(), Some("Uncoded languages"));
    }

    #[test]
    fn lookup_indexes_two_and_three_letter_codes() {
        let table = read_language_table(SAMPLE.as_bytes()).unwrap();
        let lookup = language_lookup(&table);
        assert_eq!(lookup.get("fr").map(String::as_str), Some("French"));
        assert_eq!(lookup.get("fre").map(String::as_str), Some("French"));
        assert_eq!(lookup.get("fra").map(String::as_str), Some("French"));
        assert_eq!(lookup.get("sq").map(String::as_str), Some("Albanian"));
        assert!(!lookup.contains_key("xx"));
    }
}
