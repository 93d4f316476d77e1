use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use unicode_width::UnicodeWidthStr;

/// Semantic style of a text segment. Mapping classes to concrete terminal
/// styles is deferred to rendering time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StyleClass {
    #[default]
    Plain,
    GitSha,
    GitBranch,
    GitTag,
    GitHead,
    Provider,
    StatusPassed,
    StatusFailed,
    StatusRunning,
    StatusSkipped,
}

impl StyleClass {
    fn style(self) -> Style {
        match self {
            StyleClass::Plain => Style::default(),
            StyleClass::GitSha => Style::default().fg(Color::Yellow),
            StyleClass::GitBranch => Style::default().fg(Color::Cyan),
            StyleClass::GitTag => Style::default().fg(Color::Yellow),
            StyleClass::GitHead => Style::default().fg(Color::LightCyan),
            StyleClass::Provider => Style::default().add_modifier(Modifier::BOLD),
            StyleClass::StatusPassed => Style::default().fg(Color::Green),
            StyleClass::StatusFailed => Style::default().fg(Color::Red),
            StyleClass::StatusRunning => Style::default().fg(Color::LightYellow),
            StyleClass::StatusSkipped => Style::default().fg(Color::DarkGray),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    text: String,
    class: StyleClass,
}

/// Horizontal alignment of a value inside its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Right,
}

/// A string made of consecutively styled segments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StyledString {
    segments: Vec<Segment>,
}

impl StyledString {
    pub fn new(text: impl Into<String>) -> StyledString {
        StyledString::styled(text, StyleClass::Plain)
    }

    pub fn styled(text: impl Into<String>, class: StyleClass) -> StyledString {
        let text = text.into();
        if text.is_empty() {
            return StyledString::default();
        }
        StyledString {
            segments: vec![Segment { text, class }],
        }
    }

    pub fn append(&mut self, text: impl Into<String>) {
        self.append_styled(text, StyleClass::Plain);
    }

    pub fn append_styled(&mut self, text: impl Into<String>, class: StyleClass) {
        let text = text.into();
        if !text.is_empty() {
            self.segments.push(Segment { text, class });
        }
    }

    pub fn extend(&mut self, other: StyledString) {
        self.segments.extend(other.segments);
    }

    /// Display width in terminal cells.
    pub fn width(&self) -> usize {
        self.segments.iter().map(|s| s.text.width()).sum()
    }

    /// Concatenated text without styling, for searching and tests.
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn join(items: Vec<StyledString>, sep: &StyledString) -> StyledString {
        let mut result = StyledString::default();
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                result.extend(sep.clone());
            }
            result.extend(item);
        }
        result
    }

    /// Fit the string into exactly `width` cells: truncate when too wide,
    /// pad with spaces otherwise. Right-aligned strings keep their tail and
    /// are padded on the left.
    pub fn fit(&self, width: usize, alignment: Alignment) -> StyledString {
        let current = self.width();
        if current > width {
            return match alignment {
                Alignment::Left => self.truncate_head(width),
                Alignment::Right => self.truncate_tail(width),
            };
        }

        let mut result = self.clone();
        let padding = " ".repeat(width - current);
        if padding.is_empty() {
            return result;
        }
        match alignment {
            Alignment::Left => result.append(padding),
            Alignment::Right => {
                let mut padded = StyledString::new(padding);
                padded.extend(result);
                result = padded;
            }
        }
        result
    }

    /// Keep at most `width` cells from the start of the string.
    pub fn truncate_head(&self, width: usize) -> StyledString {
        let mut result = StyledString::default();
        let mut remaining = width;
        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            let mut text = String::new();
            for c in segment.text.chars() {
                let w = unicode_width::UnicodeWidthChar::width(c).unwrap_or(0);
                if w > remaining {
                    break;
                }
                remaining -= w;
                text.push(c);
            }
            result.append_styled(text, segment.class);
        }
        result
    }

    // Keep at most `width` cells from the end of the string.
    fn truncate_tail(&self, width: usize) -> StyledString {
        let mut kept: Vec<Segment> = Vec::new();
        let mut remaining = width;
        for segment in self.segments.iter().rev() {
            if remaining == 0 {
                break;
            }
            let mut text = String::new();
            for c in segment.text.chars().rev() {
                let w = unicode_width::UnicodeWidthChar::width(c).unwrap_or(0);
                if w > remaining {
                    break;
                }
                remaining -= w;
                text.insert(0, c);
            }
            if !text.is_empty() {
                kept.push(Segment {
                    text,
                    class: segment.class,
                });
            }
        }
        kept.reverse();
        StyledString { segments: kept }
    }

    /// Render to a ratatui line, optionally with the selection style.
    pub fn to_line(&self, selected: bool) -> Line<'static> {
        let spans: Vec<Span<'static>> = self
            .segments
            .iter()
            .map(|segment| {
                let mut style = segment.class.style();
                if selected {
                    style = style.add_modifier(Modifier::REVERSED);
                }
                Span::styled(segment.text.clone(), style)
            })
            .collect();
        Line::from(spans)
    }
}
