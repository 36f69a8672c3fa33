use crate::tui::app::{CurrentScreen, Series, Visualizer};
use ratatui::{
    prelude::*,
    symbols,
    widgets::{Axis, Block, Chart, Dataset, GraphType, Paragraph},
};

pub fn ui<B: Backend>(f: &mut Frame, app: &Visualizer) {
    let chunks = Layout::default()
        .constraints([Constraint::Percentage(100)])
        .split(f.area());

    match app.current_screen {
        CurrentScreen::Main => main_screen::<B>(f, app, chunks[0]),
        CurrentScreen::Exiting => exiting_screen::<B>(f, chunks[0]),
        CurrentScreen::TrainingView => training_screen::<B>(f, app, chunks[0]),
    }
}

fn latest(series: &Series, precision: usize) -> String {
    series
        .last()
        .map(|v| format!("{v:.precision$}"))
        .unwrap_or_else(|| "-".into())
}

fn main_screen<B: Backend>(f: &mut Frame, app: &Visualizer, area: Rect) {
    let status = if app.finished {
        "Training finished".green()
    } else {
        "Training running".yellow()
    };
    let text = vec![
        Line::from("YOLO Training Dashboard".bold()),
        Line::from(status),
        Line::from(""),
        Line::from(format!("Loss: {}", latest(&app.loss, 4))),
        Line::from(format!("Learning rate: {}", latest(&app.learning_rate, 6))),
        Line::from(format!("Validation mAP: {}", latest(&app.map, 4))),
        Line::from(""),
        Line::from("Press 't' to view the training process."),
        Line::from("Press 'q' to quit."),
    ];
    let paragraph = Paragraph::new(text)
        .block(Block::bordered().title("Main Menu"))
        .alignment(Alignment::Center);
    f.render_widget(paragraph, area);
}

fn exiting_screen<B: Backend>(f: &mut Frame, area: Rect) {
    let text = "Are you sure you want to quit? (y/n)";
    let paragraph = Paragraph::new(text)
        .block(Block::bordered().title("Exit"))
        .alignment(Alignment::Center);
    f.render_widget(paragraph, area);
}

fn training_screen<B: Backend>(f: &mut Frame, app: &Visualizer, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Percentage(30),
            Constraint::Percentage(30),
        ])
        .split(area);

    render_chart::<B>(f, &app.loss, "Training Loss", "Batch", Color::Red, chunks[0]);
    render_chart::<B>(f, &app.learning_rate, "Learning Rate", "Batch", Color::Cyan, chunks[1]);
    render_chart::<B>(f, &app.map, "Validation mAP", "Epoch", Color::Green, chunks[2]);
}

fn render_chart<B: Backend>(
    f: &mut Frame,
    series: &Series,
    title: &str,
    x_title: &str,
    color: Color,
    area: Rect,
) {
    let datasets = vec![
        Dataset::default()
            .name(title.to_string())
            .marker(symbols::Marker::Dot)
            .style(Style::default().fg(color))
            .graph_type(GraphType::Line)
            .data(&series.points),
    ];

    let chart = Chart::new(datasets)
        .block(Block::bordered().title(title.to_string()))
        .x_axis(
            Axis::default()
                .title(x_title.to_string())
                .style(Style::default().fg(Color::Gray))
                .bounds(series.x_bounds()),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds(series.y_bounds()),
        );

    f.render_widget(chart, area);
}
