use std::fmt::{Display, Formatter, Write};
use std::time::Duration;

use serde::Serialize;

/// How a node run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

/// One node run observed by a session.
#[derive(Debug, Clone, Serialize)]
pub struct NodeExecution {
    /// The rendered node key, e.g. `read_file(FilePath("a.txt"))`.
    pub node: String,
    pub rule: String,
    /// Offset from the creation of the session.
    pub started_after: Duration,
    pub duration: Duration,
    pub outcome: Outcome,
}

/// Execution metrics collected by a session.
///
/// Only nodes which actually ran in the session appear here; memoized
/// results reused from earlier runs do not.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    pub executions: Vec<NodeExecution>,
}

impl Diagnostics {
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// How many times a rule body ran.
    pub fn runs_of(&self, rule: &str) -> usize {
        self.executions.iter().filter(|e| e.rule == rule).count()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.executions
            .iter()
            .filter(|e| e.outcome == outcome)
            .count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct WaterfallLayout {
    row_height: u32,
    label_width: u32,
    chart_width: u32,
    padding: u32,
    header_height: u32,
    text_space: u32,
}

impl Default for WaterfallLayout {
    fn default() -> Self {
        Self {
            row_height: 30,
            label_width: 300,
            chart_width: 800,
            padding: 10,
            header_height: 30,
            text_space: 80,
        }
    }
}

impl WaterfallLayout {
    fn total_width(&self) -> u32 {
        self.label_width + self.chart_width + (self.padding * 3) + self.text_space
    }

    fn total_height(&self, rows: usize) -> u32 {
        self.header_height + (rows as u32 * self.row_height) + self.padding
    }
}

struct TimelineStats {
    origin: Duration,
    total_micros: f64,
}

impl TimelineStats {
    /// Expects the runs sorted by start.
    fn from_runs(runs: &[&NodeExecution]) -> Option<Self> {
        let origin = runs.first()?.started_after;
        let end = runs.iter().map(|e| e.started_after + e.duration).max()?;
        let total_micros = end.saturating_sub(origin).as_micros().max(1) as f64;

        Some(Self {
            origin,
            total_micros,
        })
    }

    fn format_duration(micros: f64) -> String {
        if micros < 1000.0 {
            format!("{:.0}µs", micros)
        } else {
            format!("{:.2}ms", micros / 1000.0)
        }
    }
}

impl Diagnostics {
    /// Renders a waterfall chart of the session as an SVG file.
    pub fn render_waterfall_to_file(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), std::io::Error> {
        std::fs::write(path, self.render_waterfall())
    }

    /// Renders a waterfall chart of the session as an SVG string.
    pub fn render_waterfall(&self) -> String {
        let mut runs: Vec<&NodeExecution> = self.executions.iter().collect();
        runs.sort_by_key(|e| e.started_after);

        let Some(stats) = TimelineStats::from_runs(&runs) else {
            return render_empty_state();
        };
        let layout = WaterfallLayout::default();

        let mut svg = String::with_capacity(runs.len() * 500);
        write_svg_header(&mut svg, &layout, runs.len());
        write_grid(&mut svg, &layout, &stats);
        _ = write_runs(&mut svg, &layout, &stats, &runs);
        svg.push_str("</svg>");
        svg
    }
}

fn render_empty_state() -> String {
    r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg">
            <text x="10" y="30" font-family="sans-serif">No nodes ran</text>
        </svg>"#
        .to_string()
}

fn write_svg_header(buf: &mut String, layout: &WaterfallLayout, rows: usize) {
    let w = layout.total_width();
    let h = layout.total_height(rows);

    let css = r#"
        .row:nth-child(even) { fill: #f9f9f9; }
        .row:nth-child(odd) { fill: #ffffff; }
        text { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Helvetica, Arial, sans-serif; font-size: 12px; }
        .bar { fill: #3b82f6; rx: 4; }
        .bar:hover { fill: #2563eb; }
        .bar.failed { fill: #ef4444; }
        .bar.cancelled { fill: #9ca3af; }
        .label { fill: #333; }
        .time { fill: #666; font-size: 11px; }
        .grid-line { stroke: #e5e7eb; stroke-width: 1; }
        .axis-label { fill: #9ca3af; font-size: 10px; }"#;

    let _ = write!(
        buf,
        r#"<svg width="{}" height="{}" xmlns="http://www.w3.org/2000/svg"><style>{}</style><rect width="100%" height="100%" fill="white" />"#,
        w, h, css
    );
}

fn write_grid(buf: &mut String, layout: &WaterfallLayout, stats: &TimelineStats) {
    let steps = 5;
    for i in 0..=steps {
        let pct = i as f64 / steps as f64;
        let label = TimelineStats::format_duration(stats.total_micros * pct);
        let x = layout.label_width as f64 + layout.padding as f64 + (layout.chart_width as f64 * pct);

        let _ = write!(
            buf,
            r#"<line x1="{x:.1}" y1="{y1}" x2="{x:.1}" y2="100%" class="grid-line" /><text x="{x:.1}" y="{y_text}" text-anchor="middle" class="axis-label">{label}</text>"#,
            x = x,
            y1 = layout.header_height,
            y_text = layout.header_height - 5,
            label = label
        );
    }
}

fn write_runs(
    buf: &mut String,
    layout: &WaterfallLayout,
    stats: &TimelineStats,
    runs: &[&NodeExecution],
) -> std::fmt::Result {
    for (i, run) in runs.iter().enumerate() {
        let name = XmlSafe(&run.node);
        let y_pos = layout.header_height + (i as u32 * layout.row_height);
        let y_center = y_pos + (layout.row_height / 2);

        write!(
            buf,
            r#"<rect x="0" y="{}" width="100%" height="{}" class="row" />"#,
            y_pos, layout.row_height
        )?;

        write!(
            buf,
            r#"<text x="{}" y="{}" class="label" dominant-baseline="middle">{}</text>"#,
            layout.padding, y_center, name
        )?;

        let offset_micros = run.started_after.saturating_sub(stats.origin).as_micros() as f64;
        let duration_micros = run.duration.as_micros() as f64;

        let bar_x = layout.label_width as f64
            + layout.padding as f64
            + (offset_micros / stats.total_micros * layout.chart_width as f64);
        let bar_w = (duration_micros / stats.total_micros * layout.chart_width as f64).max(1.0);

        let class = match run.outcome {
            Outcome::Completed => "bar",
            Outcome::Failed => "bar failed",
            Outcome::Cancelled => "bar cancelled",
        };

        write!(
            buf,
            r#"<rect x="{x:.1}" y="{y}" width="{w:.1}" height="{h}" class="{class}"><title>{name}: {dur:.2?}</title></rect>"#,
            x = bar_x,
            y = y_pos + 5,
            w = bar_w,
            h = layout.row_height - 10,
            class = class,
            name = name,
            dur = run.duration
        )?;

        write!(
            buf,
            r#"<text x="{x:.1}" y="{y}" class="time" dominant-baseline="middle">{text}</text>"#,
            x = bar_x + bar_w + 5.0,
            y = y_center,
            text = TimelineStats::format_duration(duration_micros)
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(node: &str, start_ms: u64, dur_ms: u64, outcome: Outcome) -> NodeExecution {
        NodeExecution {
            node: node.to_string(),
            rule: node.split('(').next().unwrap_or_default().to_string(),
            started_after: Duration::from_millis(start_ms),
            duration: Duration::from_millis(dur_ms),
            outcome,
        }
    }

    #[test]
    fn test_empty_waterfall() {
        let svg = Diagnostics::default().render_waterfall();
        assert!(svg.contains("No nodes ran"));
    }

    #[test]
    fn test_waterfall_escapes_node_names() {
        let diagnostics = Diagnostics {
            executions: vec![
                run("read(\"<a>\")", 0, 10, Outcome::Completed),
                run("parse()", 10, 5, Outcome::Failed),
            ],
        };

        let svg = diagnostics.render_waterfall();
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("read(&quot;&lt;a&gt;&quot;)"));
        assert!(svg.contains("bar failed"));
    }

    #[test]
    fn test_counts() {
        let diagnostics = Diagnostics {
            executions: vec![
                run("a()", 0, 1, Outcome::Completed),
                run("a()", 2, 1, Outcome::Cancelled),
                run("b()", 0, 1, Outcome::Failed),
            ],
        };

        assert_eq!(diagnostics.runs_of("a"), 2);
        assert_eq!(diagnostics.count(Outcome::Failed), 1);
        assert!(diagnostics.to_json().unwrap().contains("\"Cancelled\""));
    }
}
