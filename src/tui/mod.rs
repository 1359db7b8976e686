mod help;

use crate::model::JobState;
use crate::orchestrator::{EventReceiver, Session};
use crate::progress::ProgressState;
use anyhow::{anyhow, Context, Result};
use crossterm::{
    event::{
        self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs},
    Terminal,
};
use std::{io, time::Duration, time::Instant};
use time::{macros::format_description, UtcOffset};
use tracing::info;

#[derive(Default)]
struct UiState {
    tab: usize,
    /// Path being typed after `o`, or a drop that arrived as keystrokes.
    input: Option<String>,
    /// Lines scrolled up from the bottom of the log; 0 follows new output.
    scroll_back: usize,
    tick: u64,
    info: String,
}

/// Run the terminal UI until the user quits.
pub async fn run(session: Session, events: EventReceiver) -> Result<()> {
    // The session lives on the UI thread; terminal input polling blocks.
    let ui_handle = std::thread::Builder::new()
        .name("tui".into())
        .spawn(move || run_threaded(session, events))
        .context("spawn TUI thread")?;

    let joined = tokio::task::spawn_blocking(move || ui_handle.join())
        .await
        .context("joining TUI thread")?;
    match joined {
        Ok(res) => res,
        Err(_) => Err(anyhow!("TUI thread panicked")),
    }
}

/// Run the TUI loop on a dedicated thread. The session lives here, so every
/// state change happens on this thread.
fn run_threaded(mut session: Session, mut events: EventReceiver) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableBracketedPaste).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let mut state = UiState {
        info: "Ready.".into(),
        ..Default::default()
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain without blocking; the bridge is unbounded so workers never wait on us.
        while let Some(ev) = events.try_recv() {
            session.apply(ev);
        }
        // Only the headless printer consumes this; keep it from growing.
        session.drain_output();

        if last_tick.elapsed() >= tick_rate {
            state.tick = state.tick.wrapping_add(1);
            terminal.draw(|f| draw(f.area(), f, &session, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if !event::poll(Duration::from_millis(10)).unwrap_or(false) {
            continue;
        }
        match event::read() {
            Ok(Event::Paste(text)) => match state.input.as_mut() {
                Some(buf) => buf.push_str(text.trim_end_matches(['\r', '\n'])),
                None => {
                    state.scroll_back = 0;
                    submit(&mut session, &mut state, &text);
                }
            },
            Ok(Event::Key(k)) => {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if k.modifiers == KeyModifiers::CONTROL && k.code == KeyCode::Char('c') {
                    break Ok(());
                }
                if let Some(buf) = state.input.as_mut() {
                    match k.code {
                        KeyCode::Enter => {
                            let raw = std::mem::take(buf);
                            state.input = None;
                            submit(&mut session, &mut state, &raw);
                        }
                        KeyCode::Esc => {
                            state.input = None;
                            state.info = "Cancelled.".into();
                        }
                        KeyCode::Backspace => {
                            buf.pop();
                        }
                        KeyCode::Char(c) => buf.push(c),
                        _ => {}
                    }
                    continue;
                }
                match k.code {
                    KeyCode::Char('q') => break Ok(()),
                    KeyCode::Char('?') => state.tab = if state.tab == 1 { 0 } else { 1 },
                    KeyCode::Tab => state.tab = (state.tab + 1) % 2,
                    KeyCode::Esc => state.tab = 0,
                    KeyCode::Char('o') => {
                        state.tab = 0;
                        state.input = Some(String::new());
                    }
                    // Terminals without bracketed paste type a dropped path out.
                    KeyCode::Char(c @ ('/' | '\'' | '"')) => {
                        state.tab = 0;
                        state.input = Some(c.to_string());
                    }
                    KeyCode::Up | KeyCode::Char('k') => {
                        state.scroll_back = state.scroll_back.saturating_add(1);
                    }
                    KeyCode::Down | KeyCode::Char('j') => {
                        state.scroll_back = state.scroll_back.saturating_sub(1);
                    }
                    KeyCode::PageUp => state.scroll_back = state.scroll_back.saturating_add(10),
                    KeyCode::PageDown => state.scroll_back = state.scroll_back.saturating_sub(10),
                    KeyCode::End | KeyCode::Char('G') => state.scroll_back = 0,
                    _ => {}
                }
            }
            _ => {}
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, DisableBracketedPaste, LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();
    res
}

fn submit(session: &mut Session, state: &mut UiState, raw: &str) {
    let accepted = session.submit_dropped(raw);
    state.info = if accepted {
        info!(path = %raw.trim(), "job submitted from the terminal");
        "Submitted.".into()
    } else {
        "Not started; see the log.".into()
    };
}

fn draw(area: Rect, f: &mut ratatui::Frame, session: &Session, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![Line::from("Classifier"), Line::from("Help")])
        .select(state.tab)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("trailcam-classifier"),
        )
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_main(chunks[1], f, session, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_main(area: Rect, f: &mut ratatui::Frame, session: &Session, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // drop zone / path input
                Constraint::Min(3),    // transcript
                Constraint::Length(3), // progress
                Constraint::Length(3), // status
            ]
            .as_ref(),
        )
        .split(area);

    draw_drop_zone(rows[0], f, session, state);
    draw_log(rows[1], f, session, state);
    draw_progress(rows[2], f, session, state);
    draw_status(rows[3], f, session, state);
}

fn draw_drop_zone(area: Rect, f: &mut ratatui::Frame, session: &Session, state: &UiState) {
    let line = match state.input.as_deref() {
        Some(buf) => Line::from(vec![
            Span::styled("Folder: ", Style::default().fg(Color::Yellow)),
            Span::raw(buf.to_string()),
            Span::styled("_", Style::default().add_modifier(Modifier::SLOW_BLINK)),
        ]),
        None if session.is_busy() => Line::from(Span::styled(
            "Classifying… new folders are refused until this run finishes.",
            Style::default().fg(Color::DarkGray),
        )),
        None => Line::from(vec![
            Span::raw("Drop a folder here, or press "),
            Span::styled("o", Style::default().fg(Color::Magenta)),
            Span::raw(" to type a path."),
        ]),
    };
    let p = Paragraph::new(line).block(Block::default().borders(Borders::ALL).title("Input"));
    f.render_widget(p, area);
}

fn draw_log(area: Rect, f: &mut ratatui::Frame, session: &Session, state: &UiState) {
    let mut lines: Vec<Line> = Vec::new();
    for entry in session.transcript() {
        let style = if entry.starts_with("An error occurred") {
            Style::default().fg(Color::Red)
        } else {
            Style::default()
        };
        for part in entry.lines() {
            lines.push(Line::from(Span::styled(part.to_string(), style)));
        }
    }

    let height = area.height.saturating_sub(2) as usize;
    let max_top = lines.len().saturating_sub(height);
    let top = max_top.saturating_sub(state.scroll_back);
    let title = if state.scroll_back > 0 && max_top > 0 {
        format!("Log (scrolled, {} more below)", max_top - top)
    } else {
        "Log".to_string()
    };

    let p = Paragraph::new(lines)
        .scroll((top.min(u16::MAX as usize) as u16, 0))
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_progress(area: Rect, f: &mut ratatui::Frame, session: &Session, state: &UiState) {
    let block = Block::default().borders(Borders::ALL).title("Progress");
    let p = session.progress();
    match p.fraction() {
        Some(ratio) => {
            let g = Gauge::default()
                .block(block)
                .gauge_style(Style::default().fg(Color::Green))
                .ratio(ratio)
                .label(progress_label(p));
            f.render_widget(g, area);
        }
        None if session.is_busy() => {
            let width = area.width.saturating_sub(2) as usize;
            let bar = Paragraph::new(Span::styled(
                bouncing_bar(width, state.tick),
                Style::default().fg(Color::Green),
            ))
            .block(block);
            f.render_widget(bar, area);
        }
        None => {
            let g = Gauge::default()
                .block(block)
                .gauge_style(Style::default().fg(Color::Green))
                .ratio(0.0)
                .label(progress_label(p));
            f.render_widget(g, area);
        }
    }
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, session: &Session, state: &UiState) {
    let mut spans = Vec::new();
    match session.last_job() {
        Some((id, job_state)) => {
            let color = match job_state {
                JobState::Running => Color::Yellow,
                JobState::Completed => Color::Green,
                JobState::Failed => Color::Red,
                JobState::Idle => Color::Gray,
            };
            spans.push(Span::raw(format!("Job {id} ")));
            spans.push(Span::styled(job_state.label(), Style::default().fg(color)));
            if let Some(started) = session.runner().current().map(|j| j.created_at) {
                let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
                let fmt = format_description!("[hour]:[minute]:[second]");
                if let Ok(s) = started.to_offset(offset).format(&fmt) {
                    spans.push(Span::raw(format!(" (started {s})")));
                }
            }
            if let Some(item) = session.current_item() {
                spans.push(Span::raw("  "));
                spans.push(Span::styled(
                    item.to_string(),
                    Style::default().fg(Color::Cyan),
                ));
            }
        }
        None => spans.push(Span::styled("Idle", Style::default().fg(Color::Gray))),
    }
    if !state.info.is_empty() {
        spans.push(Span::raw("  | "));
        spans.push(Span::raw(state.info.clone()));
    }
    spans.push(Span::styled(
        "  q quit · ? help",
        Style::default().fg(Color::DarkGray),
    ));

    let p = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

fn progress_label(p: ProgressState) -> String {
    match p.total {
        Some(total) if total > 0 => format!("{}/{}", p.current, total),
        _ if p.current > 0 => format!("{} processed", p.current),
        _ => String::new(),
    }
}

/// A block that slides back and forth across `width` cells.
fn bouncing_bar(width: usize, tick: u64) -> String {
    if width == 0 {
        return String::new();
    }
    let block = (width / 5).max(1);
    let travel = width - block;
    let pos = if travel == 0 {
        0
    } else {
        let period = (travel * 2) as u64;
        let step = (tick % period) as usize;
        if step <= travel {
            step
        } else {
            2 * travel - step
        }
    };
    let mut s = String::with_capacity(width * 3);
    s.push_str(&" ".repeat(pos));
    s.push_str(&"█".repeat(block));
    s.push_str(&" ".repeat(width - pos - block));
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bouncing_bar_stays_in_bounds() {
        for width in [0usize, 1, 4, 5, 37, 80] {
            for tick in 0..200u64 {
                let s = bouncing_bar(width, tick);
                assert_eq!(s.chars().count(), width, "width {width} tick {tick}");
            }
        }
    }

    #[test]
    fn bouncing_bar_turns_around() {
        let first = bouncing_bar(10, 0);
        let back = bouncing_bar(10, 16);
        assert!(first.starts_with("██"));
        assert_eq!(first, back);
    }

    #[test]
    fn label_shows_counts() {
        assert_eq!(
            progress_label(ProgressState {
                current: 3,
                total: Some(10)
            }),
            "3/10"
        );
        assert_eq!(
            progress_label(ProgressState {
                current: 2,
                total: Some(0)
            }),
            "2 processed"
        );
        assert_eq!(progress_label(ProgressState::default()), "");
    }
}
