use anyhow::Result;
use codetree_core::ledger::VisitCounts;
use codetree_core::walk::WalkEvent;
use codetree_scanner::{VisitRecord, VisitStatus};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
};
use std::io;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;

const MAX_VISITS: usize = 5000;
const MAX_LOGS: usize = 500;
const PAGE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// TUI state for following a walk
pub struct WalkMonitor {
    visits: Vec<VisitRecord>,
    selected_visit: Option<usize>,
    logs: Vec<(LogLevel, String)>,
    counts: VisitCounts,
    recoveries: usize,
    status_message: String,
    run_id: Option<String>,
    portal_url: Option<String>,
    is_complete: bool,
    stop_requested: bool,
    scroll_visits: usize,
    scroll_logs: usize,
    rx: mpsc::UnboundedReceiver<WalkEvent>,
}

impl WalkMonitor {
    pub fn new(rx: mpsc::UnboundedReceiver<WalkEvent>) -> Self {
        Self {
            visits: Vec::new(),
            selected_visit: None,
            logs: Vec::new(),
            counts: VisitCounts::default(),
            recoveries: 0,
            status_message: "Opening classification root...".to_string(),
            run_id: None,
            portal_url: None,
            is_complete: false,
            stop_requested: false,
            scroll_visits: 0,
            scroll_logs: 0,
            rx,
        }
    }

    /// Drain pending events without blocking
    fn process_messages(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.apply(event);
        }
    }

    fn push_log(&mut self, level: LogLevel, message: String) {
        self.logs.push((level, message));
        if self.logs.len() > MAX_LOGS {
            self.logs.drain(0..self.logs.len() - MAX_LOGS);
        }
    }

    fn apply(&mut self, event: WalkEvent) {
        match event {
            WalkEvent::Started { run_id, portal_url } => {
                self.push_log(LogLevel::Info, format!("Run {} started", run_id));
                self.run_id = Some(run_id);
                self.portal_url = Some(portal_url);
            }
            WalkEvent::Visit(record) => {
                self.counts.add(record.status);
                self.status_message = format!("{} {}", record.status, record.path);
                if record.status == VisitStatus::Failed {
                    self.push_log(
                        LogLevel::Warn,
                        format!(
                            "{}: {}",
                            record.path,
                            record.error_detail.as_deref().unwrap_or("failed")
                        ),
                    );
                }
                self.visits.push(record);
                if self.visits.len() > MAX_VISITS {
                    let dropped = self.visits.len() - MAX_VISITS;
                    self.visits.drain(0..dropped);
                    if let Some(selected) = self.selected_visit {
                        self.selected_visit = Some(selected.saturating_sub(dropped));
                    }
                }
            }
            WalkEvent::Recovery(event) => {
                self.recoveries += 1;
                let level = if event.recovered {
                    LogLevel::Warn
                } else {
                    LogLevel::Error
                };
                self.push_log(
                    level,
                    format!(
                        "Session lost at '{}' ({}), {}",
                        event.scope,
                        event.cause,
                        if event.recovered { "recovered" } else { "not recovered" }
                    ),
                );
            }
            WalkEvent::Log(message) => {
                let level = if message.contains("ERROR") {
                    LogLevel::Error
                } else if message.contains("WARN") {
                    LogLevel::Warn
                } else {
                    LogLevel::Info
                };
                self.push_log(level, message);
            }
            WalkEvent::Finished { counts, cancelled } => {
                self.is_complete = true;
                self.counts = counts;
                self.status_message = format!(
                    "Walk {}: {} downloaded, {} failed, {} skipped",
                    if cancelled { "cancelled" } else { "complete" },
                    counts.success,
                    counts.failed,
                    counts.skipped
                );
            }
        }
    }

    fn render_visits(&self, f: &mut Frame, area: Rect) {
        let title = format!(" Visits ({}) ", self.visits.len());
        let block = Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(Style::default().fg(Color::Cyan));

        let inner = block.inner(area);
        f.render_widget(block, area);

        let height = inner.height as usize;
        let total_items = self.visits.len();

        if total_items == 0 {
            let empty_msg = Paragraph::new("No leaves visited yet...")
                .style(Style::default().fg(Color::DarkGray))
                .wrap(Wrap { trim: true });
            f.render_widget(empty_msg, inner);
            return;
        }

        let scroll_offset = match self.selected_visit {
            Some(selected) if selected < self.scroll_visits => selected,
            Some(selected) if selected >= self.scroll_visits + height => {
                selected.saturating_sub(height.saturating_sub(1))
            }
            Some(_) => self.scroll_visits,
            // follow the tail while nothing is selected
            None if self.scroll_visits == 0 && total_items > height => total_items - height,
            None => self.scroll_visits.min(total_items.saturating_sub(height)),
        };

        let items: Vec<ListItem> = self
            .visits
            .iter()
            .enumerate()
            .skip(scroll_offset)
            .take(height)
            .map(|(idx, record)| {
                let (icon, color) = match record.status {
                    VisitStatus::Success => ("✓", Color::Green),
                    VisitStatus::Skipped => ("→", Color::DarkGray),
                    VisitStatus::Failed => ("✗", Color::Red),
                };
                let text = match &record.error_kind {
                    Some(kind) => format!("{} {} [{}]", icon, record.path, kind),
                    None => format!("{} {}", icon, record.path),
                };

                let mut style = Style::default().fg(color);
                if Some(idx) == self.selected_visit {
                    style = style.bg(Color::DarkGray).add_modifier(Modifier::BOLD);
                }
                ListItem::new(text).style(style)
            })
            .collect();

        f.render_widget(List::new(items), inner);

        if total_items > height {
            render_scrollbar(f, area, total_items, height, scroll_offset);
        }
    }

    fn render_progress(&self, f: &mut Frame, area: Rect) {
        let (title, border_color) = if self.is_complete {
            (" Complete ", Color::Green)
        } else if self.stop_requested {
            (" Stopping ", Color::Red)
        } else {
            (" Progress ", Color::Yellow)
        };

        let block = Block::default()
            .borders(Borders::ALL)
            .title(title)
            .border_style(Style::default().fg(border_color));

        let inner = block.inner(area);
        f.render_widget(block, area);

        let status_icon = if self.is_complete { "✓" } else { "⠋" };

        let mut text = vec![
            Line::from(vec![
                Span::styled(status_icon, Style::default().fg(Color::Cyan)),
                Span::raw(" "),
                Span::styled(
                    format!("{} ok", self.counts.success),
                    Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
                ),
                Span::raw("  "),
                Span::styled(
                    format!("{} failed", self.counts.failed),
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                ),
                Span::raw("  "),
                Span::styled(
                    format!("{} skipped", self.counts.skipped),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::raw("  "),
                Span::styled(
                    format!("{} recoveries", self.recoveries),
                    Style::default().fg(Color::Yellow),
                ),
            ]),
            Line::from(""),
        ];

        if let Some(ref run_id) = self.run_id {
            text.push(Line::from(vec![
                Span::styled("Run: ", Style::default().fg(Color::DarkGray)),
                Span::styled(run_id.clone(), Style::default().fg(Color::Cyan)),
            ]));
        }
        if let Some(ref portal_url) = self.portal_url {
            text.push(Line::from(vec![
                Span::styled("Portal: ", Style::default().fg(Color::DarkGray)),
                Span::raw(portal_url.clone()),
            ]));
        }
        text.push(Line::from(""));
        text.push(Line::from(self.status_message.clone()));

        f.render_widget(Paragraph::new(text).wrap(Wrap { trim: true }), inner);
    }

    fn render_logs(&self, f: &mut Frame, area: Rect) {
        let block = Block::default()
            .borders(Borders::ALL)
            .title(" Logs ")
            .border_style(Style::default().fg(Color::Magenta));

        let inner = block.inner(area);
        f.render_widget(block, area);

        let height = inner.height as usize;
        let total_items = self.logs.len();

        let scroll_offset = if self.scroll_logs == 0 && total_items > height {
            total_items.saturating_sub(height)
        } else {
            self.scroll_logs.min(total_items.saturating_sub(height))
        };

        let items: Vec<ListItem> = self
            .logs
            .iter()
            .skip(scroll_offset)
            .take(height)
            .map(|(level, message)| {
                let (prefix, style) = match level {
                    LogLevel::Info => ("INFO ", Style::default().fg(Color::Blue)),
                    LogLevel::Warn => ("WARN ", Style::default().fg(Color::Yellow)),
                    LogLevel::Error => ("ERROR", Style::default().fg(Color::Red)),
                };
                ListItem::new(format!("[{}] {}", prefix, message)).style(style)
            })
            .collect();

        f.render_widget(List::new(items), inner);
    }

    fn render_hints(&self, f: &mut Frame, area: Rect) {
        let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Black).bg(Color::Gray));
        let first = if self.is_complete {
            vec![key(" q/ESC "), Span::raw(" Exit  ")]
        } else {
            vec![key(" q/Ctrl+C "), Span::raw(" Stop after current leaf  ")]
        };
        let mut spans = first;
        spans.extend([
            key(" ↑/↓ "),
            Span::raw(" Select  "),
            key(" PgUp/PgDn "),
            Span::raw(" Scroll  "),
            key(" Home/End "),
            Span::raw(" Top/Bottom  "),
            key(" Enter "),
            Span::raw(" Details"),
        ]);

        let paragraph = Paragraph::new(Line::from(spans))
            .style(Style::default().bg(Color::Black).fg(Color::Gray));
        f.render_widget(paragraph, area);
    }

    fn show_details(&mut self, index: usize) {
        let Some(record) = self.visits.get(index).cloned() else {
            return;
        };
        self.push_log(LogLevel::Info, String::new());
        self.push_log(LogLevel::Info, "═══════════════ VISIT DETAILS ═══════════════".to_string());
        self.push_log(LogLevel::Info, format!("Path: {}", record.path));
        self.push_log(LogLevel::Info, format!("Status: {}", record.status));
        self.push_log(
            LogLevel::Info,
            format!("When: {}", record.timestamp.format("%Y-%m-%d %H:%M:%S UTC")),
        );
        if let Some(artifact) = &record.artifact {
            self.push_log(
                LogLevel::Info,
                format!("Artifact: {}", artifact.path.display()),
            );
        }
        if let Some(kind) = &record.error_kind {
            self.push_log(LogLevel::Warn, format!("Cause: {}", kind));
        }
        if let Some(detail) = &record.error_detail {
            self.push_log(LogLevel::Warn, format!("Detail: {}", detail));
        }
    }

    fn select_up(&mut self) {
        if self.visits.is_empty() {
            return;
        }
        match self.selected_visit {
            Some(selected) => {
                let new_selected = selected.saturating_sub(1);
                self.selected_visit = Some(new_selected);
                if new_selected < self.scroll_visits {
                    self.scroll_visits = new_selected;
                }
            }
            None => self.selected_visit = Some(self.visits.len() - 1),
        }
    }

    fn select_down(&mut self) {
        if self.visits.is_empty() {
            return;
        }
        self.selected_visit = Some(match self.selected_visit {
            Some(selected) => (selected + 1).min(self.visits.len() - 1),
            None => self.scroll_visits,
        });
    }

    fn page_up(&mut self) {
        self.scroll_visits = self.scroll_visits.saturating_sub(PAGE);
        if let Some(selected) = self.selected_visit
            && selected >= self.scroll_visits + PAGE
        {
            self.selected_visit = Some(self.scroll_visits + PAGE - 1);
        }
    }

    fn page_down(&mut self) {
        let max_scroll = self.visits.len().saturating_sub(PAGE);
        self.scroll_visits = (self.scroll_visits + PAGE).min(max_scroll);
        if let Some(selected) = self.selected_visit
            && selected < self.scroll_visits
        {
            self.selected_visit = Some(self.scroll_visits);
        }
    }
}

fn render_scrollbar(f: &mut Frame, area: Rect, total_items: usize, visible_items: usize, scroll_offset: usize) {
    let scrollbar_height = area.height.saturating_sub(2) as usize;
    if scrollbar_height == 0 || total_items <= visible_items {
        return;
    }

    let thumb_size = ((visible_items as f32 / total_items as f32) * scrollbar_height as f32)
        .max(1.0)
        .floor() as usize;
    let scroll_ratio = scroll_offset as f32 / (total_items - visible_items) as f32;
    let thumb_position =
        (scroll_ratio * scrollbar_height.saturating_sub(thumb_size) as f32).floor() as usize;

    let scrollbar_x = area.x + area.width - 1;
    for i in 0..scrollbar_height {
        let on_thumb = i >= thumb_position && i < thumb_position + thumb_size;
        let (symbol, color) = if on_thumb {
            ("█", Color::Cyan)
        } else {
            ("│", Color::DarkGray)
        };
        f.render_widget(
            Paragraph::new(symbol).style(Style::default().fg(color)),
            Rect {
                x: scrollbar_x,
                y: area.y + 1 + i as u16,
                width: 1,
                height: 1,
            },
        );
    }
}

/// Run the walk monitor (blocking; run it on its own thread).
///
/// Quitting while the walk is still running sets `cancel`, which stops the
/// walk after the in-flight leaf; the monitor then stays up until the walk
/// reports it has finished. `should_exit` closes the monitor from outside.
pub fn run_monitor(
    rx: mpsc::UnboundedReceiver<WalkEvent>,
    cancel: Arc<AtomicBool>,
    should_exit: Arc<AtomicBool>,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut monitor = WalkMonitor::new(rx);

    loop {
        monitor.process_messages();

        terminal.draw(|f| {
            let vertical_chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Min(10), Constraint::Length(1)])
                .split(f.area());

            let main_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
                .split(vertical_chunks[0]);

            let right_chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(8), Constraint::Min(10)])
                .split(main_chunks[1]);

            monitor.render_visits(f, main_chunks[0]);
            monitor.render_progress(f, right_chunks[0]);
            monitor.render_logs(f, right_chunks[1]);
            monitor.render_hints(f, vertical_chunks[1]);
        })?;

        if should_exit.load(Ordering::Relaxed) {
            break;
        }

        if event::poll(std::time::Duration::from_millis(100))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            let quit = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL));
            if quit {
                if monitor.is_complete {
                    break;
                }
                if !monitor.stop_requested {
                    monitor.stop_requested = true;
                    cancel.store(true, Ordering::SeqCst);
                    monitor.push_log(
                        LogLevel::Warn,
                        "Stop requested, finishing the current leaf".to_string(),
                    );
                }
                continue;
            }

            match key.code {
                KeyCode::Up => monitor.select_up(),
                KeyCode::Down => monitor.select_down(),
                KeyCode::Enter => {
                    if let Some(selected) = monitor.selected_visit {
                        monitor.show_details(selected);
                    }
                }
                KeyCode::PageUp => monitor.page_up(),
                KeyCode::PageDown => monitor.page_down(),
                KeyCode::Home => {
                    monitor.scroll_visits = 0;
                    if !monitor.visits.is_empty() {
                        monitor.selected_visit = Some(0);
                    }
                }
                KeyCode::End => {
                    if !monitor.visits.is_empty() {
                        monitor.selected_visit = Some(monitor.visits.len() - 1);
                        monitor.scroll_visits = monitor.visits.len().saturating_sub(PAGE);
                    }
                }
                _ => {}
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    Ok(())
}

/// Create a channel pair for walk monitoring
pub fn create_monitor_channel() -> (mpsc::UnboundedSender<WalkEvent>, mpsc::UnboundedReceiver<WalkEvent>) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codetree_scanner::{CategoryPath, RecoveryEvent, ScanError};

    fn path(key: &str) -> CategoryPath {
        CategoryPath::parse_key(key).unwrap()
    }

    #[test]
    fn test_events_update_state() {
        let (tx, rx) = create_monitor_channel();
        let mut monitor = WalkMonitor::new(rx);

        tx.send(WalkEvent::Started {
            run_id: "run-1".to_string(),
            portal_url: "http://portal".to_string(),
        })
        .unwrap();
        tx.send(WalkEvent::Visit(VisitRecord::skipped(path("A > B > C"))))
            .unwrap();
        tx.send(WalkEvent::Visit(VisitRecord::failed(
            path("A > B > D"),
            &ScanError::DownloadFailed("no results".to_string()),
        )))
        .unwrap();
        tx.send(WalkEvent::Recovery(RecoveryEvent {
            scope: "A > B > D".to_string(),
            cause: "page closed".to_string(),
            attempts: 1,
            recovered: true,
            at: chrono::Utc::now(),
        }))
        .unwrap();
        monitor.process_messages();

        assert_eq!(monitor.run_id.as_deref(), Some("run-1"));
        assert_eq!(monitor.visits.len(), 2);
        assert_eq!(monitor.counts.skipped, 1);
        assert_eq!(monitor.counts.failed, 1);
        assert_eq!(monitor.recoveries, 1);
        assert!(!monitor.is_complete);
        // started, failure, recovery
        assert_eq!(monitor.logs.len(), 3);
    }

    #[test]
    fn test_finished_event_completes() {
        let (tx, rx) = create_monitor_channel();
        let mut monitor = WalkMonitor::new(rx);
        let counts = VisitCounts {
            success: 3,
            failed: 1,
            skipped: 0,
        };
        tx.send(WalkEvent::Finished {
            counts,
            cancelled: true,
        })
        .unwrap();
        monitor.process_messages();

        assert!(monitor.is_complete);
        assert_eq!(monitor.counts, counts);
        assert!(monitor.status_message.starts_with("Walk cancelled"));
    }

    #[test]
    fn test_selection_bounds() {
        let (tx, rx) = create_monitor_channel();
        let mut monitor = WalkMonitor::new(rx);
        monitor.select_up();
        assert_eq!(monitor.selected_visit, None);

        for key in ["A > B > C", "A > B > D"] {
            tx.send(WalkEvent::Visit(VisitRecord::skipped(path(key))))
                .unwrap();
        }
        monitor.process_messages();

        monitor.select_up();
        assert_eq!(monitor.selected_visit, Some(1));
        monitor.select_down();
        assert_eq!(monitor.selected_visit, Some(1));
        monitor.select_up();
        monitor.select_up();
        assert_eq!(monitor.selected_visit, Some(0));

        monitor.show_details(0);
        assert!(monitor.logs.iter().any(|(_, m)| m == "Path: A > B > C"));
    }
}
