use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueFormat {
    Currency,
    Number,
    Percent,
}

impl FromStr for ValueFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "currency" => Ok(ValueFormat::Currency),
            "number" => Ok(ValueFormat::Number),
            "percent" | "percentage" => Ok(ValueFormat::Percent),
            _ => Err(()),
        }
    }
}

// Model output drifts in small ways; these keep a usable chart instead of
// failing the whole recommendation.

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Unrecognised or non-string values become `None`.
fn loose_option<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(|s| s.parse().ok()))
}

/// Axis layout shared by all category/series charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalChart {
    pub x_column: String,
    pub y_column: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default)]
    pub color_column: Option<String>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default, deserialize_with = "loose_option")]
    pub sort_order: Option<SortOrder>,
}

/// Chart recommendation, tagged by `chart_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "chart_type", rename_all = "snake_case")]
pub enum ChartConfig {
    Bar(CategoricalChart),
    HorizontalBar(CategoricalChart),
    Line(CategoricalChart),
    Area(CategoricalChart),
    Pie(CategoricalChart),
    Scatter(CategoricalChart),
    Kpi {
        value_column: String,
        #[serde(default, deserialize_with = "null_as_default")]
        title: String,
        #[serde(default, deserialize_with = "loose_option")]
        format: Option<ValueFormat>,
    },
    Table {
        #[serde(default, deserialize_with = "null_as_default")]
        title: String,
        #[serde(default, deserialize_with = "null_as_default")]
        highlight_columns: Vec<String>,
    },
}

impl ChartConfig {
    /// The fallback used whenever the model's recommendation is unusable.
    pub fn results_table() -> Self {
        ChartConfig::Table {
            title: "Results".to_string(),
            highlight_columns: Vec::new(),
        }
    }

    pub fn chart_type(&self) -> &'static str {
        match self {
            ChartConfig::Bar(_) => "bar",
            ChartConfig::HorizontalBar(_) => "horizontal_bar",
            ChartConfig::Line(_) => "line",
            ChartConfig::Area(_) => "area",
            ChartConfig::Pie(_) => "pie",
            ChartConfig::Scatter(_) => "scatter",
            ChartConfig::Kpi { .. } => "kpi",
            ChartConfig::Table { .. } => "table",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_each_shape() {
        let bar: ChartConfig = serde_json::from_value(json!({
            "chart_type": "bar",
            "x_column": "region",
            "y_column": "revenue",
            "title": "Revenue by region",
            "color_column": null,
            "sort_by": "y_column",
            "sort_order": "desc"
        }))
        .unwrap();
        assert_eq!(bar.chart_type(), "bar");
        if let ChartConfig::Bar(chart) = &bar {
            assert_eq!(chart.sort_order, Some(SortOrder::Desc));
        }

        let kpi: ChartConfig = serde_json::from_value(json!({
            "chart_type": "kpi", "value_column": "total", "title": "Total", "format": "currency"
        }))
        .unwrap();
        assert_eq!(
            kpi,
            ChartConfig::Kpi {
                value_column: "total".to_string(),
                title: "Total".to_string(),
                format: Some(ValueFormat::Currency),
            }
        );

        let table: ChartConfig =
            serde_json::from_value(json!({"chart_type": "table", "title": "Orders"})).unwrap();
        assert_eq!(table.chart_type(), "table");
    }

    #[test]
    fn serializes_with_tag() {
        let value = serde_json::to_value(ChartConfig::results_table()).unwrap();
        assert_eq!(value["chart_type"], "table");
        assert_eq!(value["title"], "Results");

        let hbar = ChartConfig::HorizontalBar(CategoricalChart {
            x_column: "a".to_string(),
            y_column: "b".to_string(),
            title: String::new(),
            color_column: None,
            sort_by: None,
            sort_order: None,
        });
        assert_eq!(serde_json::to_value(hbar).unwrap()["chart_type"], "horizontal_bar");
    }

    #[test]
    fn tolerates_null_titles_and_loose_enum_values() {
        let bar: ChartConfig = serde_json::from_value(json!({
            "chart_type": "bar",
            "x_column": "region",
            "y_column": "revenue",
            "title": null,
            "sort_order": "DESC"
        }))
        .unwrap();
        let ChartConfig::Bar(chart) = bar else {
            panic!("expected a bar chart, got {:?}", bar);
        };
        assert_eq!(chart.title, "");
        assert_eq!(chart.sort_order, Some(SortOrder::Desc));

        let kpi: ChartConfig = serde_json::from_value(json!({
            "chart_type": "kpi", "value_column": "total", "title": "Total", "format": "dollars"
        }))
        .unwrap();
        assert!(matches!(kpi, ChartConfig::Kpi { format: None, .. }));

        let table: ChartConfig = serde_json::from_value(json!({
            "chart_type": "table", "title": null, "highlight_columns": null
        }))
        .unwrap();
        assert_eq!(
            table,
            ChartConfig::Table {
                title: String::new(),
                highlight_columns: Vec::new(),
            }
        );
    }

    #[test]
    fn unknown_chart_type_is_an_error() {
        assert!(serde_json::from_value::<ChartConfig>(json!({"chart_type": "radar"})).is_err());
    }
}
