use color_eyre::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::{Terminal, prelude::*};
use std::{
    sync::mpsc::{Receiver, TryRecvError},
    time::{Duration, Instant},
};

use crate::{model::training::VALIDATION_SUBSET, sinks::MetricEvent, tui::ui::ui};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CurrentScreen {
    #[default]
    Main,
    Exiting,
    TrainingView,
}

/// Points of one plotted metric with their bounds.
#[derive(Debug, Default, Clone)]
pub struct Series {
    pub points: Vec<(f64, f64)>,
}

impl Series {
    fn push(&mut self, step: u64, value: f64) {
        if value.is_finite() {
            self.points.push((step as f64, value));
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.points.last().map(|p| p.1)
    }

    pub fn x_bounds(&self) -> [f64; 2] {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) if last.0 > first.0 => [first.0, last.0],
            (Some(first), _) => [first.0, first.0 + 1.0],
            _ => [0.0, 1.0],
        }
    }

    pub fn y_bounds(&self) -> [f64; 2] {
        let max = self.points.iter().map(|p| p.1).fold(f64::MIN, f64::max);
        if max > 0.0 { [0.0, max * 1.05] } else { [0.0, 1.0] }
    }
}

#[derive(Debug)]
pub struct Visualizer {
    pub exit: bool,
    pub current_screen: CurrentScreen,
    pub loss: Series,
    pub learning_rate: Series,
    pub map: Series,
    /// Set once the training side hung up.
    pub finished: bool,
    events: Receiver<MetricEvent>,
}

impl Visualizer {
    pub fn new(events: Receiver<MetricEvent>) -> Self {
        Self {
            exit: false,
            current_screen: CurrentScreen::default(),
            loss: Series::default(),
            learning_rate: Series::default(),
            map: Series::default(),
            finished: false,
            events,
        }
    }

    pub fn run<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        let tick_rate = Duration::from_millis(250);
        let mut last_tick = Instant::now();
        while !self.exit {
            terminal.draw(|frame| self.render::<B>(frame))?;

            let timeout = tick_rate.saturating_sub(last_tick.elapsed());
            if event::poll(timeout)? {
                if let Event::Key(key) = event::read()? {
                    self.handle_key_event(key);
                }
            }

            if last_tick.elapsed() >= tick_rate {
                self.on_tick();
                last_tick = Instant::now();
            }
        }
        Ok(())
    }

    pub fn apply(&mut self, event: &MetricEvent) {
        let map_name = format!("{VALIDATION_SUBSET}.mAP");
        match event.name.as_str() {
            "train/loss" => self.loss.push(event.step, event.value),
            "train/learning_rate" => self.learning_rate.push(event.step, event.value),
            name if name == map_name => self.map.push(event.step, event.value),
            _ => {}
        }
    }

    pub fn on_tick(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(&event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.finished = true;
                    break;
                }
            }
        }
    }

    fn render<B: Backend>(&self, frame: &mut Frame) {
        ui::<B>(frame, self);
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if key_event.kind != KeyEventKind::Press {
            return;
        }
        match self.current_screen {
            CurrentScreen::Exiting => match key_event.code {
                KeyCode::Char('y') => {
                    self.exit = true;
                }
                KeyCode::Char('n') | KeyCode::Esc => {
                    self.current_screen = CurrentScreen::Main;
                }
                _ => {}
            },
            CurrentScreen::Main => match key_event.code {
                KeyCode::Char('q') => {
                    self.current_screen = CurrentScreen::Exiting;
                }
                KeyCode::Char('t') => {
                    self.current_screen = CurrentScreen::TrainingView;
                }
                _ => {}
            },
            CurrentScreen::TrainingView => match key_event.code {
                KeyCode::Char('q') | KeyCode::Esc => {
                    self.current_screen = CurrentScreen::Main;
                }
                _ => {}
            },
        }
    }
}
