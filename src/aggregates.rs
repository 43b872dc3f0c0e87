// 📊 Aggregates - Read-only grouped queries over normalized results
// Totals, unique titles, and category/subcategory breakdowns with age filters.

use anyhow::{bail, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Age window used when no bounds are given
pub const DEFAULT_MIN_AGE: i64 = 3;
pub const DEFAULT_MAX_AGE: i64 = 125;

// ============================================================================
// DATABASE STATS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub total_entries: i64,
    pub normalized: i64,
    pub fallback: i64,
    pub unique_titles: i64,
    pub unique_categories: i64,
    pub unique_subcategories: i64,
}

pub fn database_stats(conn: &Connection) -> Result<DatabaseStats> {
    let count = |sql: &str| -> Result<i64> { Ok(conn.query_row(sql, [], |row| row.get(0))?) };

    Ok(DatabaseStats {
        total_entries: count("SELECT COUNT(*) FROM dreams")?,
        normalized: count("SELECT COUNT(*) FROM normalized_results")?,
        fallback: count("SELECT COUNT(*) FROM normalized_results WHERE is_fallback = 1")?,
        unique_titles: count("SELECT COUNT(DISTINCT normalized_title) FROM normalized_results")?,
        unique_categories: count("SELECT COUNT(DISTINCT category_1) FROM normalized_results")?,
        unique_subcategories: count(
            "SELECT COUNT(DISTINCT subcategory_1) FROM normalized_results",
        )?,
    })
}

// ============================================================================
// UNIQUE TITLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleSort {
    Count,
    Title,
    AvgAge,
}

impl FromStr for TitleSort {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "count" => Ok(TitleSort::Count),
            "title" => Ok(TitleSort::Title),
            "avg_age" | "avg-age" => Ok(TitleSort::AvgAge),
            other => bail!("unknown sort column {other:?} (expected count, title, avg_age)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => bail!("unknown sort order {other:?} (expected asc or desc)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TitleFilter {
    /// Case-insensitive substring of the title
    pub search: Option<String>,
    pub min_age: Option<i64>,
    pub max_age: Option<i64>,
    pub sort: TitleSort,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TitleFilter {
    fn default() -> Self {
        TitleFilter {
            search: None,
            min_age: None,
            max_age: None,
            sort: TitleSort::Count,
            order: SortOrder::Desc,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitleSummary {
    pub title: String,
    pub count: i64,
    pub avg_age: Option<f64>,
    pub min_age: Option<i64>,
    pub max_age: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitlePage {
    pub titles: Vec<TitleSummary>,

    /// Distinct titles matching the filter, ignoring limit/offset
    pub total_count: i64,
}

/// Distinct titles with entry counts and age statistics
pub fn unique_titles(conn: &Connection, filter: &TitleFilter) -> Result<TitlePage> {
    let mut conditions = vec!["1 = 1".to_string()];
    let mut values: Vec<Value> = Vec::new();

    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        values.push(Value::Text(format!("%{}%", escape_like(search.trim()))));
        conditions.push(format!("n.normalized_title LIKE ?{} ESCAPE '\\'", values.len()));
    }
    if let Some(min_age) = filter.min_age {
        values.push(Value::Integer(min_age));
        conditions.push(format!("d.age_at_dream >= ?{}", values.len()));
    }
    if let Some(max_age) = filter.max_age {
        values.push(Value::Integer(max_age));
        conditions.push(format!("d.age_at_dream <= ?{}", values.len()));
    }
    let where_clause = conditions.join(" AND ");

    let total_count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(DISTINCT n.normalized_title)
             FROM normalized_results n
             JOIN dreams d ON d.id = n.entry_id
             WHERE {where_clause}"
        ),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    let sort_column = match filter.sort {
        TitleSort::Count => "COUNT(*)",
        TitleSort::Title => "n.normalized_title",
        TitleSort::AvgAge => "AVG(d.age_at_dream)",
    };
    let direction = match filter.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };

    values.push(Value::Integer(filter.limit as i64));
    let limit_param = values.len();
    values.push(Value::Integer(filter.offset as i64));
    let offset_param = values.len();

    let mut stmt = conn.prepare(&format!(
        "SELECT
            n.normalized_title,
            COUNT(*) as count,
            AVG(d.age_at_dream) as avg_age,
            MIN(d.age_at_dream) as min_age,
            MAX(d.age_at_dream) as max_age
         FROM normalized_results n
         JOIN dreams d ON d.id = n.entry_id
         WHERE {where_clause}
         GROUP BY n.normalized_title
         ORDER BY {sort_column} {direction}, n.normalized_title ASC
         LIMIT ?{limit_param} OFFSET ?{offset_param}"
    ))?;

    let titles = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(TitleSummary {
                title: row.get(0)?,
                count: row.get(1)?,
                avg_age: row.get::<_, Option<f64>>(2)?.map(round_1),
                min_age: row.get(3)?,
                max_age: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TitlePage {
        titles,
        total_count,
    })
}

/// One entry under a title, for drill-down views
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitleMember {
    pub entry_id: i64,
    pub username: Option<String>,
    pub age_at_dream: Option<i64>,
    pub original_text: String,
}

/// Entries under `title`, youngest first
pub fn title_members(conn: &Connection, title: &str, limit: usize) -> Result<Vec<TitleMember>> {
    let mut stmt = conn.prepare(
        "SELECT d.id, d.username, d.age_at_dream, d.original_text
         FROM normalized_results n
         JOIN dreams d ON d.id = n.entry_id
         WHERE n.normalized_title = ?1
         ORDER BY d.age_at_dream IS NULL, d.age_at_dream ASC, d.id ASC
         LIMIT ?2",
    )?;

    let members = stmt
        .query_map(params![title, limit as i64], |row| {
            Ok(TitleMember {
                entry_id: row.get(0)?,
                username: row.get(1)?,
                age_at_dream: row.get(2)?,
                original_text: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(members)
}

// ============================================================================
// CATEGORY BREAKDOWN
// ============================================================================

/// Which column of the primary pair to group by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryLevel {
    Category,
    Subcategory,
}

impl CategoryLevel {
    fn column(&self) -> &'static str {
        match self {
            CategoryLevel::Category => "n.category_1",
            CategoryLevel::Subcategory => "n.subcategory_1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryStat {
    pub name: String,
    pub count: i64,
    pub avg_age: Option<f64>,
    pub min_age: Option<i64>,
    pub max_age: Option<i64>,

    /// Age-group label of the average age
    pub age_group: Option<&'static str>,
}

/// Primary category (or subcategory) counts for entries aged within
/// `[min_age, max_age]`, largest first
pub fn category_breakdown(
    conn: &Connection,
    level: CategoryLevel,
    min_age: i64,
    max_age: i64,
) -> Result<Vec<CategoryStat>> {
    let column = level.column();
    let mut stmt = conn.prepare(&format!(
        "SELECT
            {column} as name,
            COUNT(*) as count,
            AVG(d.age_at_dream) as avg_age,
            MIN(d.age_at_dream) as min_age,
            MAX(d.age_at_dream) as max_age
         FROM normalized_results n
         JOIN dreams d ON d.id = n.entry_id
         WHERE d.age_at_dream >= ?1 AND d.age_at_dream <= ?2
         GROUP BY {column}
         ORDER BY count DESC, name ASC"
    ))?;

    let stats = stmt
        .query_map(params![min_age, max_age], |row| {
            let avg_age: Option<f64> = row.get(2)?;
            Ok(CategoryStat {
                name: row.get(0)?,
                count: row.get(1)?,
                avg_age: avg_age.map(round_1),
                min_age: row.get(3)?,
                max_age: row.get(4)?,
                age_group: avg_age.map(age_group),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stats)
}

/// Titles whose primary pair falls under `name`, largest first
pub fn category_titles(
    conn: &Connection,
    level: CategoryLevel,
    name: &str,
    limit: usize,
) -> Result<Vec<TitleSummary>> {
    let column = level.column();
    let mut stmt = conn.prepare(&format!(
        "SELECT
            n.normalized_title,
            COUNT(*) as count,
            AVG(d.age_at_dream),
            MIN(d.age_at_dream),
            MAX(d.age_at_dream)
         FROM normalized_results n
         JOIN dreams d ON d.id = n.entry_id
         WHERE {column} = ?1
         GROUP BY n.normalized_title
         ORDER BY count DESC, n.normalized_title ASC
         LIMIT ?2"
    ))?;

    let titles = stmt
        .query_map(params![name, limit as i64], |row| {
            Ok(TitleSummary {
                title: row.get(0)?,
                count: row.get(1)?,
                avg_age: row.get::<_, Option<f64>>(2)?.map(round_1),
                min_age: row.get(3)?,
                max_age: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(titles)
}

/// Bucket label for an age
pub fn age_group(age: f64) -> &'static str {
    if age < 13.0 {
        "Under 13"
    } else if age < 19.0 {
        "13-18"
    } else if age < 31.0 {
        "19-30"
    } else if age < 46.0 {
        "31-45"
    } else if age < 61.0 {
        "46-60"
    } else {
        "60+"
    }
}

fn round_1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, setup_database, CategoryPair, NormalizedResult};
    use chrono::Utc;

    fn add(conn: &Connection, title: &str, pair: (&str, &str), age: Option<i64>) {
        let id = db::insert_entry(conn, title, Some("user"), age).unwrap();
        let result = NormalizedResult {
            entry_id: id,
            normalized_title: title.to_string(),
            categories: vec![CategoryPair::new(pair.0, pair.1)],
            is_fallback: false,
            model: "test".to_string(),
            normalized_at: Utc::now(),
        };
        db::save_normalized_result(conn, &result).unwrap();
    }

    fn sample() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        add(&conn, "become doctor", ("Career", "Medicine"), Some(10));
        add(&conn, "become doctor", ("Career", "Medicine"), Some(20));
        add(&conn, "become doctor", ("Career", "Medicine"), Some(30));
        add(&conn, "buy property", ("Financial", "Real Estate"), Some(40));
        add(&conn, "buy property", ("Financial", "Real Estate"), Some(50));
        add(&conn, "become 100% happy", ("Personal", "Wellbeing"), None);
        db::insert_entry(&conn, "still pending", None, Some(15)).unwrap();

        conn
    }

    #[test]
    fn test_database_stats() {
        let stats = database_stats(&sample()).unwrap();

        assert_eq!(stats.total_entries, 7);
        assert_eq!(stats.normalized, 6);
        assert_eq!(stats.fallback, 0);
        assert_eq!(stats.unique_titles, 3);
        assert_eq!(stats.unique_categories, 3);
        assert_eq!(stats.unique_subcategories, 3);
    }

    #[test]
    fn test_unique_titles_default_sort() {
        let page = unique_titles(&sample(), &TitleFilter::default()).unwrap();

        assert_eq!(page.total_count, 3);
        assert_eq!(page.titles[0].title, "become doctor");
        assert_eq!(page.titles[0].count, 3);
        assert_eq!(page.titles[0].avg_age, Some(20.0));
        assert_eq!(page.titles[0].min_age, Some(10));
        assert_eq!(page.titles[0].max_age, Some(30));
        assert_eq!(page.titles[2].avg_age, None);
    }

    #[test]
    fn test_unique_titles_filters_and_paging() {
        let conn = sample();

        let filter = TitleFilter {
            min_age: Some(25),
            ..TitleFilter::default()
        };
        let page = unique_titles(&conn, &filter).unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.titles[0].title, "buy property");
        assert_eq!(page.titles[1].count, 1);

        let filter = TitleFilter {
            search: Some("DOCTOR".to_string()),
            ..TitleFilter::default()
        };
        assert_eq!(unique_titles(&conn, &filter).unwrap().total_count, 1);

        // '%' is matched literally
        let filter = TitleFilter {
            search: Some("100%".to_string()),
            ..TitleFilter::default()
        };
        let page = unique_titles(&conn, &filter).unwrap();
        assert_eq!(page.titles.len(), 1);
        assert_eq!(page.titles[0].title, "become 100% happy");

        let filter = TitleFilter {
            sort: TitleSort::Title,
            order: SortOrder::Asc,
            limit: 1,
            offset: 1,
            ..TitleFilter::default()
        };
        let page = unique_titles(&conn, &filter).unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.titles.len(), 1);
        assert_eq!(page.titles[0].title, "become doctor");
    }

    #[test]
    fn test_category_breakdown_with_age_window() {
        let conn = sample();

        let stats = category_breakdown(&conn, CategoryLevel::Category, 3, 125).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "Career");
        assert_eq!(stats[0].count, 3);
        assert_eq!(stats[0].age_group, Some("19-30"));
        assert_eq!(stats[1].name, "Financial");
        assert_eq!(stats[1].age_group, Some("31-45"));

        let young = category_breakdown(&conn, CategoryLevel::Subcategory, 3, 12).unwrap();
        assert_eq!(young.len(), 1);
        assert_eq!(young[0].name, "Medicine");
        assert_eq!(young[0].age_group, Some("Under 13"));
    }

    #[test]
    fn test_category_titles_and_members() {
        let conn = sample();

        let titles = category_titles(&conn, CategoryLevel::Subcategory, "Real Estate", 10).unwrap();
        assert_eq!(titles.len(), 1);
        assert_eq!(titles[0].title, "buy property");
        assert_eq!(titles[0].count, 2);

        let members = title_members(&conn, "become doctor", 2).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].age_at_dream, Some(10));
        assert_eq!(members[0].username.as_deref(), Some("user"));
    }

    #[test]
    fn test_age_groups() {
        assert_eq!(age_group(12.9), "Under 13");
        assert_eq!(age_group(13.0), "13-18");
        assert_eq!(age_group(30.5), "19-30");
        assert_eq!(age_group(45.0), "31-45");
        assert_eq!(age_group(60.9), "46-60");
        assert_eq!(age_group(61.0), "60+");
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!("avg_age".parse::<TitleSort>().unwrap(), TitleSort::AvgAge);
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("loudest".parse::<TitleSort>().is_err());
    }
}
