use std::collections::HashMap;

use serde_json::Value;

/// Display names of the company that owns the news of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyName {
    pub name: String,
    /// Korean display name. An empty value never overwrites a stored one.
    pub name_kr: String,
}

impl CompanyName {
    pub fn new(name: &str, name_kr: &str) -> Self {
        Self {
            name: name.to_owned(),
            name_kr: name_kr.to_owned(),
        }
    }
}

/// Maps normalized source names to company display names.
#[derive(Debug, Clone)]
pub struct CompanyDirectory {
    companies: HashMap<String, CompanyName>,
}

impl Default for CompanyDirectory {
    fn default() -> Self {
        let companies = [
            ("toss", CompanyName::new("Toss", "토스")),
            ("kakao", CompanyName::new("Kakao", "카카오")),
            ("naver", CompanyName::new("Naver", "네이버")),
        ]
        .into_iter()
        .map(|(source, company)| (source.to_owned(), company))
        .collect();

        Self { companies }
    }
}

impl CompanyDirectory {
    /// Parse a `{"source": ["Name", "NameKr"]}` object, replacing the built-in table.
    /// Values that are not arrays of at least two strings are ignored.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let parsed: HashMap<String, Value> = serde_json::from_str(raw)?;

        let companies = parsed
            .into_iter()
            .filter_map(|(source, value)| {
                let names = value.as_array()?;
                let name = names.first()?.as_str()?;
                let name_kr = names.get(1)?.as_str()?;
                Some((normalize_source(&source), CompanyName::new(name, name_kr)))
            })
            .collect();

        Ok(Self { companies })
    }

    /// Unknown sources fall back to the source itself for both names.
    pub fn resolve(&self, source: &str) -> CompanyName {
        let source = normalize_source(source);
        if source.is_empty() {
            return CompanyName::new("unknown", "미지정");
        }

        self.companies
            .get(&source)
            .cloned()
            .unwrap_or_else(|| CompanyName::new(&source, &source))
    }
}

pub fn normalize_source(source: &str) -> String {
    source.trim().to_lowercase()
}
