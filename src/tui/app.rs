use std::io;
use std::io::Write;
use std::process::{Command, Stdio};

use chrono::{FixedOffset, Local, Offset};
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures::StreamExt;
use log::warn;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::Rect;
use ratatui::text::Line;
use ratatui::widgets::Paragraph;
use ratatui::Terminal;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::models::{Commit, PipelineKey};
use crate::monitor;
use crate::tui::steps::{self, Column, TaskRow};
use crate::tui::table::HierarchicalTable;
use crate::tui::text::{StyleClass, StyledString};

enum Mode {
    Normal,
    Search { input: String, forward: bool },
}

struct App {
    cache: Cache,
    ref_: String,
    tz: FixedOffset,
    table: HierarchicalTable<TaskRow>,
    mode: Mode,
    last_search: Option<(String, bool)>,
    sort_column: Option<usize>,
    sort_ascending: bool,
    status: Option<String>,
    quit: bool,
}

const SORTABLE_COLUMNS: &[Column] = &[
    Column::Ref,
    Column::Pipeline,
    Column::State,
    Column::Name,
    Column::Created,
    Column::Started,
    Column::Finished,
    Column::Updated,
    Column::Duration,
];

impl App {
    fn new(cache: Cache, ref_: String) -> App {
        let tz = Local::now().offset().fix();
        App {
            cache,
            ref_,
            tz,
            table: HierarchicalTable::new(steps::table_configuration(), Vec::new(), 0, 0),
            mode: Mode::Normal,
            last_search: None,
            sort_column: None,
            sort_ascending: true,
            status: None,
            quit: false,
        }
    }

    /// Re-project the cached pipelines into table rows.
    fn refresh(&mut self) {
        let mut tasks = Vec::new();
        for pipeline in self.cache.pipelines_by_ref(&self.ref_) {
            let provider = self
                .cache
                .provider_name(&pipeline.provider_id)
                .unwrap_or("unknown")
                .to_owned();
            match steps::task_from_pipeline(&pipeline, &provider, &self.tz) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    warn!("failed to project pipeline {:?}: {err}", pipeline.key());
                    self.status = Some(err.to_string());
                }
            }
        }
        tasks.sort_by_key(TaskRow::sort_time);
        self.table.replace(tasks);
    }

    fn commit_lines(&self) -> Vec<Line<'static>> {
        let Some(commit) = self.cache.commit(&self.ref_) else {
            return Vec::new();
        };
        commit_header(&commit, &self.tz)
            .into_iter()
            .map(|s| s.to_line(false))
            .collect()
    }

    fn status_line(&self) -> Line<'static> {
        match &self.mode {
            Mode::Search { input, forward } => {
                let prompt = if *forward { '/' } else { '?' };
                Line::from(format!("{prompt}{input}"))
            }
            Mode::Normal => match &self.status {
                Some(status) => Line::from(status.clone()),
                None => Line::from(
                    "q:quit  o/O:open  c/C:close  /:search  s/S:sort  b:browser  l:logs"
                        .to_owned(),
                ),
            },
        }
    }

    fn handle_key(&mut self, key: KeyEvent) {
        match &mut self.mode {
            Mode::Search { input, forward } => match key.code {
                KeyCode::Esc => self.mode = Mode::Normal,
                KeyCode::Enter => {
                    let (needle, forward) = (input.clone(), *forward);
                    self.mode = Mode::Normal;
                    if !needle.is_empty() {
                        if !self.table.scroll_to_next_match(&needle, forward) {
                            self.status = Some(format!("no match for {needle:?}"));
                        }
                        self.last_search = Some((needle, forward));
                    }
                }
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char(c) => input.push(c),
                _ => {}
            },
            Mode::Normal => {
                self.status = None;
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => self.quit = true,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        self.quit = true;
                    }
                    KeyCode::Down | KeyCode::Char('j') => self.table.vertical_scroll(1),
                    KeyCode::Up | KeyCode::Char('k') => self.table.vertical_scroll(-1),
                    KeyCode::PageDown => self.table.vertical_scroll(10),
                    KeyCode::PageUp => self.table.vertical_scroll(-10),
                    KeyCode::Home => self.table.vertical_scroll(-1_000_000),
                    KeyCode::End => self.table.vertical_scroll(1_000_000),
                    KeyCode::Right => self.table.horizontal_scroll(1),
                    KeyCode::Left => self.table.horizontal_scroll(-1),
                    KeyCode::Char('o') => self.table.set_traversable(true, false),
                    KeyCode::Char('O') => self.table.set_traversable(true, true),
                    KeyCode::Char('c') => self.table.set_traversable(false, false),
                    KeyCode::Char('C') => self.table.set_traversable(false, true),
                    KeyCode::Char('/') => {
                        self.mode = Mode::Search {
                            input: String::new(),
                            forward: true,
                        }
                    }
                    KeyCode::Char('?') => {
                        self.mode = Mode::Search {
                            input: String::new(),
                            forward: false,
                        }
                    }
                    KeyCode::Char('n') => self.repeat_search(true),
                    KeyCode::Char('N') => self.repeat_search(false),
                    KeyCode::Char('s') => self.cycle_sort(true),
                    KeyCode::Char('S') => self.cycle_sort(false),
                    _ => {}
                }
            }
        }
    }

    fn repeat_search(&mut self, same_direction: bool) {
        if let Some((needle, forward)) = self.last_search.clone() {
            let forward = forward == same_direction;
            if !self.table.scroll_to_next_match(&needle, forward) {
                self.status = Some(format!("no match for {needle:?}"));
            }
        }
    }

    fn cycle_sort(&mut self, ascending: bool) {
        let next = match self.sort_column {
            Some(index) if self.sort_ascending == ascending => {
                (index + 1) % SORTABLE_COLUMNS.len()
            }
            Some(index) => index,
            None => 0,
        };
        self.sort_column = Some(next);
        self.sort_ascending = ascending;
        self.table.sort_by(SORTABLE_COLUMNS[next], ascending);
    }

    /// Pipeline key and step path of the row under the cursor.
    fn selected_step(&self) -> Option<(PipelineKey, Vec<String>)> {
        let path = self.table.selected_path()?;
        let task_key = path.last()?;
        let (pipeline_id, step_ids) = task_key.step_ids.split_first()?;
        Some((
            PipelineKey {
                provider_host: task_key.provider_host.clone(),
                id: pipeline_id.clone(),
            },
            step_ids.to_vec(),
        ))
    }

    fn open_in_browser(&mut self) {
        let url = self
            .selected_step()
            .and_then(|(key, path)| self.cache.step(&key, &path))
            .and_then(|step| step.web_url);
        let Some(url) = url else {
            self.status = Some("no URL associated to this row".to_owned());
            return;
        };

        let browser = std::env::var("BROWSER").unwrap_or_else(|_| "xdg-open".to_owned());
        let spawned = Command::new(browser)
            .arg(&url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if spawned.is_err() {
            self.status = Some(format!("failed to open {url}"));
        }
    }
}

/// Git-log style description of the monitored commit.
fn commit_header(commit: &Commit, tz: &FixedOffset) -> Vec<StyledString> {
    let mut title = StyledString::styled(format!("commit {}", commit.sha), StyleClass::GitSha);

    if !commit.branches.is_empty() || !commit.tags.is_empty() {
        let mut refs: Vec<StyledString> = Vec::new();
        for tag in &commit.tags {
            refs.push(StyledString::styled(
                format!("tag: {tag}"),
                StyleClass::GitTag,
            ));
        }
        for branch in &commit.branches {
            if Some(branch) == commit.head.as_ref() {
                let mut head = StyledString::styled("HEAD -> ", StyleClass::GitHead);
                head.append_styled(branch.clone(), StyleClass::GitBranch);
                refs.insert(0, head);
            } else {
                refs.push(StyledString::styled(branch.clone(), StyleClass::GitBranch));
            }
        }

        title.append_styled(" (", StyleClass::GitSha);
        title.extend(StyledString::join(
            refs,
            &StyledString::styled(", ", StyleClass::GitSha),
        ));
        title.append_styled(")", StyleClass::GitSha);
    }

    let mut lines = vec![
        title,
        StyledString::new(format!("Author: {}", commit.author)),
        StyledString::new(format!(
            "Date: {}",
            commit
                .date
                .map(|date| date.with_timezone(tz).format("%a %b %-d %H:%M:%S %Y").to_string())
                .unwrap_or_else(|| "-".to_owned())
        )),
        StyledString::default(),
    ];
    if let Some(subject) = commit.message.lines().next() {
        lines.push(StyledString::new(format!("    {subject}")));
    }
    lines
}

/// Run the dashboard: spawn the monitoring tasks and drive the terminal
/// until the user quits or monitoring fails.
pub async fn run(cache: Cache, repo: String, ref_: String) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let result = run_app(&mut terminal, cache, repo, ref_).await;
    restore_terminal(&mut terminal)?;
    result
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    cache: Cache,
    repo: String,
    ref_: String,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let (updates_tx, mut updates_rx) = mpsc::channel::<Instant>(16);

    let mut monitor_task = tokio::spawn(monitor::monitor_pipelines(
        cache.clone(),
        repo,
        ref_.clone(),
        cancel.clone(),
        updates_tx,
    ));
    let mut monitor_done = false;

    let mut app = App::new(cache, ref_);
    app.refresh();

    let mut events = EventStream::new();

    let result = loop {
        draw(terminal, &mut app)?;

        tokio::select! {
            tick = updates_rx.recv() => {
                if tick.is_some() {
                    // Coalesce bursts of updates into one projection.
                    while updates_rx.try_recv().is_ok() {}
                    app.refresh();
                }
            }
            event = events.next() => {
                match event {
                    Some(Ok(Event::Key(key))) => {
                        if matches!(key.kind, KeyEventKind::Press | KeyEventKind::Repeat) {
                            match key.code {
                                KeyCode::Char('b') if matches!(app.mode, Mode::Normal) => {
                                    app.open_in_browser();
                                }
                                KeyCode::Char('l') | KeyCode::Enter
                                    if matches!(app.mode, Mode::Normal) =>
                                {
                                    view_log(terminal, &mut app).await?;
                                }
                                _ => app.handle_key(key),
                            }
                        }
                    }
                    Some(Ok(Event::Resize(..))) => {}
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(Error::Io(err)),
                    None => break Ok(()),
                }
            }
            joined = &mut monitor_task, if !monitor_done => {
                monitor_done = true;
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(Error::Canceled)) => {}
                    Ok(Err(err)) => break Err(err),
                    Err(_) => break Err(Error::Canceled),
                }
            }
        }

        if app.quit {
            break Ok(());
        }
    };

    cancel.cancel();
    if !monitor_done {
        let _ = (&mut monitor_task).await;
    }
    result
}

fn draw(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<()> {
    terminal.draw(|frame| {
        let area = frame.area();
        let commit_lines = app.commit_lines();
        let header_height = (commit_lines.len() as u16 + 1).min(area.height);

        let table_height = area.height.saturating_sub(header_height + 1);
        app.table
            .resize(area.width as usize, table_height as usize);

        let header_area = Rect::new(area.x, area.y, area.width, header_height);
        frame.render_widget(Paragraph::new(commit_lines), header_area);

        let table_area = Rect::new(area.x, area.y + header_height, area.width, table_height);
        frame.render_widget(Paragraph::new(app.table.render_lines()), table_area);

        let status_area = Rect::new(
            area.x,
            area.y + area.height.saturating_sub(1),
            area.width,
            1,
        );
        frame.render_widget(Paragraph::new(app.status_line()), status_area);
    })?;
    Ok(())
}

/// Fetch the log of the selected step and page through it with `$PAGER`,
/// handing the terminal over for the duration.
async fn view_log(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<()> {
    let Some((key, step_ids)) = app.selected_step() else {
        return Ok(());
    };

    let log = match app.cache.log(&key, &step_ids).await {
        Ok(log) => log,
        Err(err) => {
            app.status = Some(err.to_string());
            return Ok(());
        }
    };

    restore_terminal(terminal)?;
    let pager = std::env::var("PAGER").unwrap_or_else(|_| "less".to_owned());
    let status = Command::new(&pager)
        .stdin(Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            if let Some(stdin) = child.stdin.as_mut() {
                stdin.write_all(log.as_bytes())?;
            }
            child.wait()
        });

    *terminal = setup_terminal()?;
    if let Err(err) = status {
        app.status = Some(format!("failed to run pager {pager:?}: {err}"));
    }
    Ok(())
}
