use crate::device::Spectrometer;
use crate::session::{Session, SessionState};
use crate::utils::Counter;
use anyhow::Result;
use crossbeam_channel::tick;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::Duration;

/// Live status monitor for a running [`Session`].
pub struct Status<'a, D: Spectrometer> {
    pub session: &'a Session<D>,
    pub counter: Counter,
    pub resource: String,
    last_ok: u64,
    peak: Option<(usize, f64)>,
    exit: bool,
}

impl<'a, D: Spectrometer> Status<'a, D> {
    pub fn new(session: &'a Session<D>, resource: String) -> Self {
        Self {
            session,
            counter: Counter::default(),
            resource,
            last_ok: 0,
            peak: None,
            exit: false,
        }
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<()> {
        let ticker = tick(Duration::from_millis(250));

        while !self.exit {
            let _ = ticker.recv();

            self.update();
            self.handle_events()?;

            terminal.draw(|f| self.draw(f))?;
        }
        Ok(())
    }

    fn update(&mut self) {
        let stats = self.session.statistics();
        if stats.ok < self.last_ok {
            self.counter.reset();
            self.last_ok = 0;
        }
        self.counter.increment(stats.ok - self.last_ok);
        self.last_ok = stats.ok;

        let events = self.session.events();
        if events.user_data_ready.take() {
            self.peak = self
                .session
                .user_buffer()
                .try_read(|m| m.peak())
                .flatten();
        }
        if !events.user_data_request.is_set() {
            self.session.request_user_data();
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        while event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Key(key_event) if key_event.kind == KeyEventKind::Press => {
                    self.handle_key_event(key_event)
                }
                _ => {}
            };
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        match key_event.code {
            KeyCode::Char('s') => self.session.start(),
            KeyCode::Char('x') => self.session.stop(),
            KeyCode::Char('c') if self.session.state() == SessionState::Disconnected => {
                self.session.connect(&self.resource)
            }
            KeyCode::Char('q') => self.exit = true,
            _ => {}
        }
    }
}

impl<D: Spectrometer> Widget for &Status<'_, D> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" Spectrometer {} ", self.resource).bold());
        let instructions = Line::from(vec![
            " Connect ".into(),
            "<C>".blue().bold(),
            " Start ".into(),
            "<S>".blue().bold(),
            " Stop ".into(),
            "<X>".blue().bold(),
            " Quit ".into(),
            "<Q> ".blue().bold(),
        ]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let stats = self.session.statistics();
        let peak = match self.peak {
            Some((bin, value)) => format!("bin {} = {:.3e}", bin, value),
            None => "-".to_string(),
        };
        let flags = match (stats.overflow, stats.memory_error) {
            (false, false) => "ok".to_string().green(),
            (overflow, memory) => format!("overflow={} memory={}", overflow, memory).red(),
        };

        let status_text = Text::from(vec![
            Line::from(vec![
                "Session: ".into(),
                self.session.state().label().yellow(),
                " Acquisition: ".into(),
                self.session.acquisition().state().label().yellow(),
                " Logged: ".into(),
                self.session.logger().stored().to_string().yellow(),
            ]),
            Line::from(vec![
                "Measurements: ".into(),
                stats.ok.to_string().yellow(),
                " Dropped: ".into(),
                stats.dropped.to_string().yellow(),
                " Blocked: ".into(),
                stats.blocked.to_string().yellow(),
                " Total: ".into(),
                stats.total.to_string().yellow(),
            ]),
            Line::from(vec![
                "Rate: ".into(),
                format!("{:.2}", self.counter.rate()).yellow(),
                " /s ".into(),
                " Peak: ".into(),
                peak.yellow(),
                " Flags: ".into(),
                flags,
            ]),
        ]);

        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(area, buf);
    }
}
