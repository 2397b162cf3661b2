//! Nodes (live leaders and workers)
//! Notifications (recent task end tokens)
//! Queues (inbound / outbound depth)

use std::{
  error::Error,
  io,
  sync::Arc,
  thread,
  time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};
use tokio::runtime::Runtime;
use satdispatch::{
  clock::{Clock, SystemClock},
  config::Config,
  database::setup_database,
  messaging::{create_rabbit_channel, MessageQueue, RabbitQueue},
  models::{NodeRecord, NodeRole, NotificationToken},
  notification::{NotificationStore, PgNotificationStore},
  registry::{NodeRegistry, PgNodeRegistry},
};

const NOTIFICATION_HISTORY_SECS: i64 = 3600;
const REFRESH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Copy)]
enum DashboardTab {
  Nodes,
  Notifications,
  Queues,
}

struct QueueDepth {
  name: String,
  depth: Option<u32>,
}

struct App {
  current_tab: DashboardTab,
  leaders: Vec<NodeRecord>,
  workers: Vec<NodeRecord>,
  notifications: Vec<NotificationToken>,
  queues: Vec<QueueDepth>,
  last_error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Nodes,
      leaders: vec![],
      workers: vec![],
      notifications: vec![],
      queues: vec![],
      last_error: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Nodes => DashboardTab::Notifications,
      DashboardTab::Notifications => DashboardTab::Queues,
      DashboardTab::Queues => DashboardTab::Nodes,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Nodes => DashboardTab::Queues,
      DashboardTab::Notifications => DashboardTab::Nodes,
      DashboardTab::Queues => DashboardTab::Notifications,
    }
  }
}

struct Sources {
  registry: Arc<dyn NodeRegistry>,
  notifications: Arc<dyn NotificationStore>,
  queues: Vec<RabbitQueue>,
  clock: Arc<dyn Clock>,
  within_secs: i64,
}

async fn fetch_state(sources: &Sources) -> App {
  let mut app = App::new();
  match sources.registry.list_live(NodeRole::Leader, sources.within_secs).await {
    Ok(leaders) => app.leaders = leaders,
    Err(e) => app.last_error = Some(e.to_string()),
  }
  match sources.registry.list_live(NodeRole::Worker, sources.within_secs).await {
    Ok(workers) => app.workers = workers,
    Err(e) => app.last_error = Some(e.to_string()),
  }
  let cutoff = sources.clock.now() - NOTIFICATION_HISTORY_SECS;
  match sources.notifications.scan(cutoff, None).await {
    Ok(tokens) => app.notifications = tokens,
    Err(e) => app.last_error = Some(e.to_string()),
  }
  for queue in &sources.queues {
    app.queues.push(QueueDepth { name: queue.name().to_string(), depth: queue.depth().await.ok() });
  }
  app
}

fn format_epoch(seconds: i64) -> String {
  DateTime::<Utc>::from_timestamp(seconds, 0)
    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "N/A".into())
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env()?;
  let rt = Runtime::new()?;
  let sources = rt.block_on(async {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let db_pool = setup_database(&config.database_url).await?;
    let channel = create_rabbit_channel(&config.rabbitmq_url).await?;
    let inbound = RabbitQueue::declare(channel.clone(), &config.inbound_queue).await?;
    let outbound = RabbitQueue::declare(channel, &config.outbound_queue).await?;
    Ok::<_, anyhow::Error>(Sources {
      registry: Arc::new(PgNodeRegistry::new(db_pool.clone(), clock.clone())),
      notifications: Arc::new(PgNotificationStore::new(db_pool)),
      queues: vec![inbound, outbound],
      clock,
      within_secs: config.node_expiration_secs,
    })
  })?;

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let (tx, rx) = std::sync::mpsc::channel::<App>();
  thread::spawn(move || {
    loop {
      let state = rt.block_on(fetch_state(&sources));
      if tx.send(state).is_err() {
        break;
      }
      thread::sleep(REFRESH_INTERVAL);
    }
  });

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(mut new_state) = rx.try_recv() {
      new_state.current_tab = app.current_tab;
      app = new_state;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Nodes", "Notifications", "Queues"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("Cluster"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Nodes => 0,
      DashboardTab::Notifications => 1,
      DashboardTab::Queues => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Nodes => render_nodes(f, app, chunks[1]),
    DashboardTab::Notifications => render_notifications(f, app, chunks[1]),
    DashboardTab::Queues => render_queues(f, app, chunks[1]),
  }

  let footer_text = match &app.last_error {
    Some(e) => format!("←/→: Switch Tabs | q: Quit | last error: {}", e),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn node_items(nodes: &[NodeRecord]) -> Vec<ListItem> {
  if nodes.is_empty() {
    return vec![ListItem::new(Spans::from(Span::raw("None live")))];
  }
  nodes.iter().map(|n| {
    let status_color = if n.is_ready() { Color::Green } else { Color::Yellow };
    ListItem::new(vec![
      Spans::from(Span::styled(format!("IP: {}", n.ip_address), Style::default().add_modifier(Modifier::BOLD))),
      Spans::from(vec![
        Span::raw("Status: "),
        Span::styled(n.status.clone(), Style::default().fg(status_color)),
      ]),
      Spans::from(Span::raw(format!("ID: {}", n.node_id))),
      Spans::from(Span::raw(format!("Last heartbeat: {}", format_epoch(n.last_heartbeat)))),
    ])
  }).collect()
}

fn render_nodes<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let leaders = List::new(node_items(&app.leaders))
    .block(Block::default().borders(Borders::ALL).title(format!("Leaders ({})", app.leaders.len())));
  f.render_widget(leaders, chunks[0]);

  let workers = List::new(node_items(&app.workers))
    .block(Block::default().borders(Borders::ALL).title(format!("Workers ({})", app.workers.len())));
  f.render_widget(workers, chunks[1]);
}

fn render_notifications<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.notifications.iter().map(|n| {
    ListItem::new(Spans::from(vec![
      Span::styled(format_epoch(n.timestamp), Style::default().fg(Color::Green)),
      Span::raw(" - "),
      Span::styled(format!("{} ", n.leader), Style::default().add_modifier(Modifier::BOLD)),
      Span::raw(n.token.clone()),
    ]))
  }).collect();
  let list = List::new(items)
    .block(Block::default().borders(Borders::ALL).title("Task End Notifications (last hour)"));
  f.render_widget(list, area);
}

fn render_queues<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.queues.iter().map(|q| {
    let depth = q.depth.map(|d| d.to_string()).unwrap_or_else(|| "unavailable".into());
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{} ", q.name), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!("Pending messages: {}", depth)),
    ]))
  }).collect();
  let list = List::new(items)
    .block(Block::default().borders(Borders::ALL).title("Queues"));
  f.render_widget(list, area);
}
