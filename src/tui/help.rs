use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

fn keybind(key: &'static str, pad: usize, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(format!("{}{}", " ".repeat(pad), what)),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit"),
        ]),
        keybind("o", 11, "Type a folder path (Enter starts, Esc cancels)"),
        keybind("↑/↓", 9, "Scroll the log"),
        keybind("PgUp/PgDn", 3, "Scroll the log by a page"),
        keybind("End", 9, "Follow new log output"),
        keybind("tab", 9, "Switch tabs"),
        keybind("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Starting a run:"),
        Line::from("  Drag a folder from your file manager onto this terminal, or paste its path."),
        Line::from("  Launching trailcam-classifier again with a folder hands it to this window."),
        Line::from("  Only one classification runs at a time."),
        Line::from(""),
        Line::from("Results:"),
        Line::from("  The classifier writes its results to the configured output folder."),
    ])
    .wrap(Wrap { trim: false })
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
