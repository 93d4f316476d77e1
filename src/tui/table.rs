use std::collections::HashMap;
use std::hash::Hash;

use ratatui::text::Line;
use unicode_width::UnicodeWidthStr;

use crate::tui::text::{Alignment, StyledString};
use crate::utils;

/// A node of the forest displayed by a [`HierarchicalTable`].
///
/// `id` only has to be unique among siblings: rows are identified by the
/// path of ids from their root.
pub trait TableNode: Clone {
    type Id: Clone + Eq + Hash;
    type ColumnId: Copy + Eq + Hash;

    fn id(&self) -> Self::Id;
    fn children(&self) -> &[Self];
    fn values(&self) -> HashMap<Self::ColumnId, StyledString>;
    fn compare(&self, other: &Self, column: Self::ColumnId) -> std::cmp::Ordering;
}

pub struct Column<C> {
    pub id: C,
    pub header: &'static str,
    pub max_width: usize,
    pub alignment: Alignment,
    /// The tree-art prefix of each row is prepended to this column.
    pub tree_prefix: bool,
}

pub struct TableConfiguration<C> {
    /// Columns in display order.
    pub columns: Vec<Column<C>>,
    pub sep: String,
    pub header_suffix_ascending: String,
    pub header_suffix_descending: String,
    /// Nodes above this depth start out expanded.
    pub default_depth: usize,
}

struct InnerNode<N: TableNode> {
    node: N,
    traversable: bool,
    prefix: String,
    children: Vec<InnerNode<N>>,
}

struct Row<N: TableNode> {
    path: Vec<N::Id>,
    values: HashMap<N::ColumnId, StyledString>,
    prefix: String,
}

/// A finite forest of rows rendered as an indented table inside a viewport
/// of `width x height` character cells. The first line of the viewport is
/// the header row.
///
/// `page_index` and `cursor_index` are `None` exactly when the table is
/// empty or has no viewport; both index into the flattened list of visible
/// rows.
pub struct HierarchicalTable<N: TableNode> {
    conf: TableConfiguration<N::ColumnId>,
    nodes: Vec<InnerNode<N>>,
    rows: Vec<Row<N>>,
    width: usize,
    height: usize,
    page_index: Option<usize>,
    cursor_index: Option<usize>,
    first_column: usize,
    order: Option<(N::ColumnId, bool)>,
    column_width: HashMap<N::ColumnId, usize>,
}

impl<N: TableNode> HierarchicalTable<N> {
    pub fn new(
        conf: TableConfiguration<N::ColumnId>,
        nodes: Vec<N>,
        width: usize,
        height: usize,
    ) -> HierarchicalTable<N> {
        let mut table = HierarchicalTable {
            conf,
            nodes: Vec::new(),
            rows: Vec::new(),
            width,
            height,
            page_index: None,
            cursor_index: None,
            first_column: 0,
            order: None,
            column_width: HashMap::new(),
        };
        table.replace(nodes);
        table
    }

    fn page_size(&self) -> usize {
        // One line of the viewport is reserved for the header.
        self.height.saturating_sub(1)
    }

    fn max_page_index(&self) -> usize {
        self.rows.len().saturating_sub(self.page_size())
    }

    /// Rebuild the forest from `nodes`.
    ///
    /// The traversable state of surviving nodes is preserved, the active
    /// sort order is re-applied, and the cursor follows the node it was on
    /// where possible. A cursor resting on the very first row stays there
    /// so that a user who has not scrolled yet keeps seeing new rows stream
    /// in at their sorted position.
    pub fn replace(&mut self, nodes: Vec<N>) {
        let mut preserved: HashMap<N::Id, bool> = HashMap::new();
        for node in &self.nodes {
            collect_traversable(node, &mut preserved);
        }

        let cursor_id: Option<N::Id> = self
            .cursor_index
            .and_then(|i| self.rows.get(i))
            .and_then(|row| row.path.last().cloned());
        let prior_cursor = self.cursor_index;
        let prior_page = self.page_index;

        let default_depth = self.conf.default_depth;
        self.nodes = nodes
            .into_iter()
            .map(|node| build_inner(node, 0, default_depth, &preserved))
            .collect();
        if let Some((column, ascending)) = self.order {
            sort_inner(&mut self.nodes, column, ascending);
        }
        self.refresh();

        if self.rows.is_empty() || self.height == 0 {
            self.cursor_index = None;
            self.page_index = None;
            return;
        }

        match prior_cursor {
            None => {
                self.cursor_index = Some(0);
                self.page_index = Some(0);
            }
            Some(prior_cursor) => {
                let prior_page = prior_page.unwrap_or(0);
                let offset = prior_cursor.saturating_sub(prior_page);

                let cursor = if prior_cursor == 0 {
                    0
                } else {
                    let followed = cursor_id.and_then(|id| {
                        self.rows.iter().position(|row| row.path.last() == Some(&id))
                    });
                    match followed {
                        Some(index) => index,
                        None => prior_cursor.min(self.rows.len() - 1),
                    }
                };

                // Keep the cursor at the same position inside the viewport
                // where possible, then clamp so the viewport is filled.
                let page_size = self.page_size().max(1);
                let mut page = cursor.saturating_sub(offset).min(self.max_page_index());
                if cursor >= page + page_size {
                    page = cursor + 1 - page_size;
                }
                self.cursor_index = Some(cursor);
                self.page_index = Some(page);
            }
        }
    }

    /// Reveal or hide the children of the node under the cursor.
    pub fn set_traversable(&mut self, traversable: bool, recursive: bool) {
        let Some(cursor) = self.cursor_index else {
            return;
        };
        let Some(row) = self.rows.get(cursor) else {
            return;
        };
        let path = row.path.clone();
        if let Some(node) = find_node_mut(&mut self.nodes, &path) {
            set_node_traversable(node, traversable, recursive);
        }
        self.refresh();

        // Closing nodes can only remove rows after the cursor, but clamp
        // anyway so the viewport stays filled.
        if let (Some(cursor), Some(page)) = (self.cursor_index, self.page_index) {
            let cursor = cursor.min(self.rows.len().saturating_sub(1));
            self.cursor_index = Some(cursor);
            self.page_index = Some(page.min(self.max_page_index()));
        }
    }

    /// Move the cursor by `delta` rows, shifting the page by the minimum
    /// needed to keep the cursor visible.
    pub fn vertical_scroll(&mut self, delta: isize) {
        let (Some(cursor), Some(page)) = (self.cursor_index, self.page_index) else {
            return;
        };
        if self.rows.is_empty() {
            return;
        }

        let cursor =
            utils::bounded(cursor as i64 + delta as i64, 0, self.rows.len() as i64 - 1) as usize;
        let page_size = self.page_size().max(1);
        let mut page = page;
        if cursor < page {
            page = cursor;
        } else if cursor >= page + page_size {
            page = cursor + 1 - page_size;
        }
        self.cursor_index = Some(cursor);
        self.page_index = Some(page.min(self.max_page_index()));
    }

    /// Shift the first visible column by `delta`.
    pub fn horizontal_scroll(&mut self, delta: isize) {
        if self.conf.columns.is_empty() {
            return;
        }
        self.first_column = utils::bounded(
            self.first_column as i64 + delta as i64,
            0,
            self.conf.columns.len() as i64 - 1,
        ) as usize;
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;

        if height == 0 {
            // Re-anchored at the top by the next non-zero resize.
            self.cursor_index = None;
            self.page_index = None;
            return;
        }
        if self.rows.is_empty() {
            return;
        }

        match (self.cursor_index, self.page_index) {
            (Some(cursor), Some(page)) => {
                let page_size = self.page_size().max(1);
                let mut page = page.min(self.max_page_index());
                if cursor < page {
                    page = cursor;
                } else if cursor >= page + page_size {
                    page = cursor + 1 - page_size;
                }
                self.page_index = Some(page);
            }
            _ => {
                self.cursor_index = Some(0);
                self.page_index = Some(0);
            }
        }
    }

    /// Move the cursor to the next visible row with a column containing
    /// `needle`, searching from the cursor outwards and wrapping around.
    /// Rows hidden under collapsed nodes are not considered.
    pub fn scroll_to_next_match(&mut self, needle: &str, forward: bool) -> bool {
        let Some(cursor) = self.cursor_index else {
            return false;
        };
        if self.rows.is_empty() {
            return false;
        }

        let count = self.rows.len() as i64;
        for step in 1..=self.rows.len() {
            let delta = if forward { step as i64 } else { -(step as i64) };
            let index = utils::modulo(cursor as i64 + delta, count) as usize;
            let row = &self.rows[index];
            let matched = self.conf.columns.iter().any(|column| {
                row.values
                    .get(&column.id)
                    .is_some_and(|value| value.text().contains(needle))
            });
            if matched {
                self.move_cursor_to(index);
                return true;
            }
        }
        false
    }

    /// Recursively sort the forest by `column`. The order is re-applied to
    /// every forest loaded by later calls to [`HierarchicalTable::replace`]
    /// and reflected in the column header.
    pub fn sort_by(&mut self, column: N::ColumnId, ascending: bool) {
        self.order = Some((column, ascending));
        sort_inner(&mut self.nodes, column, ascending);
        self.refresh();
    }

    pub fn headers(&self) -> HashMap<N::ColumnId, StyledString> {
        let mut headers = HashMap::new();
        for column in &self.conf.columns {
            let mut text = column.header.to_owned();
            if let Some((active, ascending)) = self.order {
                if active == column.id {
                    text += if ascending {
                        &self.conf.header_suffix_ascending
                    } else {
                        &self.conf.header_suffix_descending
                    };
                }
            }
            headers.insert(column.id, StyledString::new(text));
        }
        headers
    }

    /// Compose one visible row from column values, honoring the horizontal
    /// scroll offset and per-column width and alignment. A selected row is
    /// padded to the full viewport width so its highlight spans the line.
    pub fn styled_string(
        &self,
        values: &HashMap<N::ColumnId, StyledString>,
        prefix: &str,
        selected: bool,
    ) -> StyledString {
        let mut cells = Vec::new();
        for column in self.conf.columns.iter().skip(self.first_column) {
            let mut value = values.get(&column.id).cloned().unwrap_or_default();
            if column.tree_prefix && !prefix.is_empty() {
                let mut prefixed = StyledString::new(prefix);
                prefixed.extend(value);
                value = prefixed;
            }
            let width = self.column_width.get(&column.id).copied().unwrap_or(0);
            cells.push(value.fit(width, column.alignment));
        }

        let sep = StyledString::new(self.conf.sep.clone());
        let mut row = StyledString::join(cells, &sep);
        if self.width > 0 && row.width() > self.width {
            row = row.truncate_head(self.width);
        }
        if selected && row.width() < self.width {
            row.append(" ".repeat(self.width - row.width()));
        }
        row
    }

    /// Viewport content: the header row followed by the current page.
    pub fn render_lines(&self) -> Vec<Line<'static>> {
        let mut lines = vec![self.styled_string(&self.headers(), "", false).to_line(false)];

        let page = self.page_index.unwrap_or(0);
        for (index, row) in self
            .rows
            .iter()
            .enumerate()
            .skip(page)
            .take(self.page_size())
        {
            let selected = self.cursor_index == Some(index);
            lines.push(
                self.styled_string(&row.values, &row.prefix, selected)
                    .to_line(selected),
            );
        }
        lines
    }

    /// Path of the row under the cursor.
    pub fn selected_path(&self) -> Option<Vec<N::Id>> {
        let cursor = self.cursor_index?;
        self.rows.get(cursor).map(|row| row.path.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn move_cursor_to(&mut self, index: usize) {
        let page_size = self.page_size().max(1);
        let mut page = self.page_index.unwrap_or(0);
        if index < page {
            page = index;
        } else if index >= page + page_size {
            page = index + 1 - page_size;
        }
        self.cursor_index = Some(index);
        self.page_index = Some(page.min(self.max_page_index()));
    }

    // Recompute prefixes, the flattened row list and column widths.
    fn refresh(&mut self) {
        for node in &mut self.nodes {
            set_prefix(node, "", true, true);
        }

        self.rows.clear();
        let mut path = Vec::new();
        for node in &self.nodes {
            push_rows(node, &mut path, &mut self.rows);
        }

        self.column_width.clear();
        let headers = self.headers();
        for column in &self.conf.columns {
            let mut width = headers
                .get(&column.id)
                .map(StyledString::width)
                .unwrap_or(0);
            for row in &self.rows {
                if let Some(value) = row.values.get(&column.id) {
                    let mut value_width = value.width();
                    if column.tree_prefix {
                        value_width += row.prefix.width();
                    }
                    width = width.max(value_width);
                }
            }
            self.column_width
                .insert(column.id, width.min(column.max_width));
        }
    }
}

fn build_inner<N: TableNode>(
    node: N,
    depth: usize,
    default_depth: usize,
    preserved: &HashMap<N::Id, bool>,
) -> InnerNode<N> {
    let children = node
        .children()
        .iter()
        .cloned()
        .map(|child| build_inner(child, depth + 1, default_depth, preserved))
        .collect();
    let traversable = preserved
        .get(&node.id())
        .copied()
        .unwrap_or(depth < default_depth);
    InnerNode {
        node,
        traversable,
        prefix: String::new(),
        children,
    }
}

fn collect_traversable<N: TableNode>(node: &InnerNode<N>, into: &mut HashMap<N::Id, bool>) {
    into.insert(node.node.id(), node.traversable);
    for child in &node.children {
        collect_traversable(child, into);
    }
}

fn sort_inner<N: TableNode>(nodes: &mut [InnerNode<N>], column: N::ColumnId, ascending: bool) {
    nodes.sort_by(|a, b| {
        let ordering = a.node.compare(&b.node, column);
        if ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
    for node in nodes {
        sort_inner(&mut node.children, column, ascending);
    }
}

fn find_node_mut<'a, N: TableNode>(
    nodes: &'a mut [InnerNode<N>],
    path: &[N::Id],
) -> Option<&'a mut InnerNode<N>> {
    let (first, rest) = path.split_first()?;
    let node = nodes.iter_mut().find(|node| &node.node.id() == first)?;
    if rest.is_empty() {
        Some(node)
    } else {
        find_node_mut(&mut node.children, rest)
    }
}

fn set_node_traversable<N: TableNode>(node: &mut InnerNode<N>, traversable: bool, recursive: bool) {
    node.traversable = traversable;
    if recursive {
        for child in &mut node.children {
            set_node_traversable(child, traversable, recursive);
        }
    }
}

fn set_prefix<N: TableNode>(node: &mut InnerNode<N>, base: &str, last: bool, root: bool) {
    let (own, child_base) = if root {
        ("-".to_owned(), String::new())
    } else {
        (
            format!("{base}{}", if last { " └── " } else { " ├── " }),
            format!("{base}{}", if last { "     " } else { " │   " }),
        )
    };
    node.prefix = own;

    let count = node.children.len();
    for (i, child) in node.children.iter_mut().enumerate() {
        set_prefix(child, &child_base, i + 1 == count, false);
    }
}

fn push_rows<'a, N: TableNode>(
    node: &'a InnerNode<N>,
    path: &mut Vec<N::Id>,
    rows: &mut Vec<Row<N>>,
) {
    path.push(node.node.id());
    rows.push(Row {
        path: path.clone(),
        values: node.node.values(),
        prefix: node.prefix.clone(),
    });
    if node.traversable {
        for child in &node.children {
            push_rows(child, path, rows);
        }
    }
    path.pop();
}
