use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use qsys_qrc::{Component, ConnectionStatus, QrcClient, StatusReceiver, UpdateReceiver};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;

struct App {
    client: QrcClient,
    components: Vec<Component>,
    selected_component: usize,
    selected_control: usize,
    status_message: String,
    connection: ConnectionStatus,
    status_receiver: StatusReceiver,
    update_receiver: UpdateReceiver,
}

impl App {
    fn new(client: QrcClient) -> Self {
        let status_receiver = client.subscribe_status();
        let update_receiver = client.subscribe_updates();
        Self {
            client,
            components: Vec::new(),
            selected_component: 0,
            selected_control: 0,
            status_message: "Connecting...".to_string(),
            connection: ConnectionStatus::default(),
            status_receiver,
            update_receiver,
        }
    }

    fn select_next_component(&mut self) {
        if !self.components.is_empty() {
            self.selected_component = (self.selected_component + 1) % self.components.len();
            self.selected_control = 0;
        }
    }

    fn select_previous_component(&mut self) {
        if !self.components.is_empty() {
            if self.selected_component == 0 {
                self.selected_component = self.components.len() - 1;
            } else {
                self.selected_component -= 1;
            }
            self.selected_control = 0;
        }
    }

    fn select_next_control(&mut self) {
        if let Some(component) = self.current_component() {
            let count = component.controls().len();
            if count > 0 {
                self.selected_control = (self.selected_control + 1) % count;
            }
        }
    }

    fn select_previous_control(&mut self) {
        if let Some(component) = self.current_component() {
            let count = component.controls().len();
            if count > 0 {
                if self.selected_control == 0 {
                    self.selected_control = count - 1;
                } else {
                    self.selected_control -= 1;
                }
            }
        }
    }

    fn current_component(&self) -> Option<Component> {
        self.components.get(self.selected_component).cloned()
    }

    fn current_control(&self) -> Option<qsys_qrc::Control> {
        self.current_component()?
            .controls()
            .get(self.selected_control)
            .cloned()
    }

    async fn refresh_components(&mut self) {
        match self.client.get_all_components().await {
            Ok(components) => {
                self.components = components;
                self.selected_component = self
                    .selected_component
                    .min(self.components.len().saturating_sub(1));
                self.status_message = format!("Loaded {} components", self.components.len());
            }
            Err(e) => {
                self.status_message = format!("Failed to load components: {}", e);
            }
        }
    }

    async fn nudge_position(&mut self, delta: f64) {
        if let Some(control) = self.current_control() {
            let target = (control.position() + delta).clamp(0.0, 1.0);
            if let Err(e) = control.set_position(target).await {
                self.status_message = format!("Failed to set {}: {}", control.name(), e);
            } else {
                self.status_message = format!("{} -> position {:.2}", control.name(), target);
            }
        }
    }

    async fn trigger_selected(&mut self) {
        if let Some(control) = self.current_control() {
            if let Err(e) = control.trigger().await {
                self.status_message = format!("Failed to trigger {}: {}", control.name(), e);
            } else {
                self.status_message = format!("Triggered {}", control.name());
            }
        }
    }

    /// Drain pending status and change-group events without blocking
    async fn handle_events(&mut self) {
        while let Ok(Some(status)) = self.status_receiver.try_recv() {
            let was_connected = self.connection.connected;
            self.connection = status.clone();
            if status.connected && (!was_connected || status.new_design) {
                self.refresh_components().await;
            }
            if status.no_reconnect {
                self.status_message = "Disconnected; press r to reconnect".to_string();
            }
        }
        while let Ok(Some(update)) = self.update_receiver.try_recv() {
            self.status_message = format!("{} control(s) changed", update.changes.len());
        }
    }
}

fn ui(f: &mut Frame, app: &App) {
    let outer_chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)])
        .split(f.size());

    render_engine_status(f, app, outer_chunks[0]);

    let inner_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(outer_chunks[1]);

    render_components(f, app, inner_chunks[0]);
    render_controls(f, app, inner_chunks[1]);
    render_status(f, app, outer_chunks[2]);
}

fn render_engine_status(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Core ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(if app.connection.connected {
            Color::Green
        } else {
            Color::Red
        }));

    let line = match &app.connection.engine_status {
        Some(engine) => Line::from(vec![
            Span::styled(
                if app.connection.connected { "CONNECTED " } else { "OFFLINE " },
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::raw(format!(
                "{} | design {} ({}) | {}",
                app.client.core_address(),
                engine.design_name,
                engine.design_code,
                engine.state,
            )),
        ]),
        None => Line::from(format!("{} | waiting for engine status", app.client.core_address())),
    };

    f.render_widget(Paragraph::new(line).block(block), area);
}

fn render_components(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Components (j/k select) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    if app.components.is_empty() {
        let text = Paragraph::new("No components loaded.")
            .block(block)
            .wrap(Wrap { trim: true });
        f.render_widget(text, area);
        return;
    }

    let items: Vec<ListItem> = app
        .components
        .iter()
        .map(|component| {
            ListItem::new(Line::from(vec![
                Span::raw(component.name().to_string()),
                Span::styled(
                    format!("  ({})", component.component_type()),
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();

    let mut state = ListState::default();
    state.select(Some(app.selected_component));

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol(">> ");

    f.render_stateful_widget(list, area, &mut state);
}

fn render_controls(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Controls (up/down select, +/- position, t trigger) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let Some(component) = app.current_component() else {
        let text = Paragraph::new("Select a component")
            .block(block)
            .wrap(Wrap { trim: true });
        f.render_widget(text, area);
        return;
    };

    let items: Vec<ListItem> = component
        .controls()
        .iter()
        .map(|control| {
            let snapshot = control.snapshot();
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:<24}", snapshot.name),
                    Style::default().fg(Color::Yellow),
                ),
                Span::raw(format!(
                    "{:>10}  {:>10}  pos {:.2}  {}",
                    snapshot.display_value(),
                    snapshot.string,
                    snapshot.position,
                    if snapshot.direction.can_write() { "rw" } else { "ro" },
                )),
            ]))
        })
        .collect();

    let mut state = ListState::default();
    state.select(Some(app.selected_control));

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol(">> ");

    f.render_stateful_widget(list, area, &mut state);
}

fn render_status(f: &mut Frame, app: &App, area: Rect) {
    let block = Block::default()
        .title(" Status (q quit, r reconnect, d disconnect) ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Gray));

    let text = Paragraph::new(app.status_message.clone())
        .block(block)
        .wrap(Wrap { trim: true });

    f.render_widget(text, area);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let client = QrcClient::new(address)?;
    client.connect().await;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(client.clone());
    let res = run_app(&mut terminal, &mut app).await;

    client.disconnect().await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        app.handle_events().await;

        if event::poll(std::time::Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') => return Ok(()),
                        KeyCode::Char('j') => app.select_next_component(),
                        KeyCode::Char('k') => app.select_previous_component(),
                        KeyCode::Down => app.select_next_control(),
                        KeyCode::Up => app.select_previous_control(),
                        KeyCode::Char('+') | KeyCode::Char('=') => {
                            app.nudge_position(0.05).await;
                        }
                        KeyCode::Char('-') | KeyCode::Char('_') => {
                            app.nudge_position(-0.05).await;
                        }
                        KeyCode::Char('t') => {
                            app.trigger_selected().await;
                        }
                        KeyCode::Char('r') => {
                            app.client.connect().await;
                            app.status_message = "Reconnecting...".to_string();
                        }
                        KeyCode::Char('d') => {
                            app.client.disconnect().await;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
