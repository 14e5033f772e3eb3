use std::collections::HashMap;
use std::io::{self, Stdout};
use std::ops::Range;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, Padding, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use textwrap::{wrap, Options as WrapOptions};
use tracing::{debug, info, warn};
use unicode_width::UnicodeWidthStr;

use crate::api;
use crate::comments::{self, CommentSection};
use crate::content::Renderer;
use crate::data::{CommentService, FeedService, FriendList, FriendService, ProfileService};
use crate::format;
use crate::mention::MentionResolver;
use crate::model::{Comment, Page, Post, Profile};
use crate::pagination::{LoadState, PageRequest, PagedList, Paginator, Sentinel};
use crate::session::AuthSession;

// Palette
const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_PANEL_FOCUSED_BG: Color = Color::Rgb(49, 50, 68);
const COLOR_PANEL_SELECTED_BG: Color = Color::Rgb(69, 71, 90);
const COLOR_BORDER_IDLE: Color = Color::Rgb(49, 50, 68);
const COLOR_BORDER_FOCUSED: Color = Color::Rgb(137, 180, 250);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const REPLY_INDENT: &str = "    ";
const CONTENT_PAGE_STEP: u16 = 10;

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let percent_x = percent_x.min(100);
    let percent_y = percent_y.min(100);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage(100 - percent_x - (100 - percent_x) / 2),
        ])
        .split(area);
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage(100 - percent_y - (100 - percent_y) / 2),
        ])
        .split(horizontal[1]);
    vertical[1]
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum View {
    Feed,
    Friends,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pane {
    Posts,
    Content,
    Comments,
}

impl Pane {
    fn title(self) -> &'static str {
        match self {
            Pane::Posts => "Feed",
            Pane::Content => "Post",
            Pane::Comments => "Comments",
        }
    }

    fn next(self) -> Self {
        match self {
            Pane::Posts => Pane::Content,
            Pane::Content => Pane::Comments,
            Pane::Comments => Pane::Comments,
        }
    }

    fn previous(self) -> Self {
        match self {
            Pane::Posts => Pane::Posts,
            Pane::Content => Pane::Posts,
            Pane::Comments => Pane::Content,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ComposerMode {
    New,
    Reply { parent_id: String },
    Edit { id: String },
}

struct Composer {
    mode: ComposerMode,
    buffer: String,
}

impl Composer {
    fn title(&self) -> &'static str {
        match self.mode {
            ComposerMode::New => "New comment",
            ComposerMode::Reply { .. } => "Reply",
            ComposerMode::Edit { .. } => "Edit comment",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FriendAction {
    Accept,
    Reject,
    Send,
    Remove,
}

impl FriendAction {
    fn run(self, service: &(dyn FriendService + Send + Sync), user_id: &str) -> Result<()> {
        match self {
            FriendAction::Accept => service.accept_request(user_id),
            FriendAction::Reject => service.reject_request(user_id),
            FriendAction::Send => service.send_request(user_id),
            FriendAction::Remove => service.remove_friend(user_id),
        }
    }

    fn applies_to(self, list: FriendList) -> bool {
        match self {
            FriendAction::Accept | FriendAction::Reject => list == FriendList::Pending,
            FriendAction::Send => list == FriendList::Suggestions,
            FriendAction::Remove => list == FriendList::Friends,
        }
    }

    fn done(self) -> &'static str {
        match self {
            FriendAction::Accept => "Now friends with",
            FriendAction::Reject => "Declined request from",
            FriendAction::Send => "Friend request sent to",
            FriendAction::Remove => "Removed",
        }
    }
}

struct CommentRow {
    id: String,
    reply: bool,
}

enum AsyncResponse {
    Feed {
        request: PageRequest,
        result: Result<Page<Post>>,
    },
    Comments {
        section_id: u64,
        request: PageRequest,
        result: Result<Page<Comment>>,
    },
    Friends {
        list: FriendList,
        request: PageRequest,
        result: Result<Page<Profile>>,
    },
    CommentCreated {
        section_id: u64,
        result: Result<Comment>,
    },
    CommentUpdated {
        section_id: u64,
        id: String,
        content: String,
        result: Result<Comment>,
    },
    CommentDeleted {
        section_id: u64,
        id: String,
        result: Result<()>,
    },
    FriendAction {
        list: FriendList,
        user_id: String,
        name: String,
        action: FriendAction,
        result: Result<()>,
    },
    Me {
        result: Result<Profile>,
    },
    Mention {
        request_id: u64,
        username: String,
        result: Result<Option<Profile>>,
    },
}

struct Spinner {
    index: usize,
    last_tick: Instant,
}

impl Spinner {
    fn new() -> Self {
        Self {
            index: 0,
            last_tick: Instant::now(),
        }
    }

    fn frame(&self) -> &'static str {
        SPINNER_FRAMES[self.index % SPINNER_FRAMES.len()]
    }

    fn advance(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_tick) >= Duration::from_millis(120) {
            self.index = (self.index + 1) % SPINNER_FRAMES.len();
            self.last_tick = now;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.last_tick = Instant::now();
    }
}

fn text_with_lines(lines: Vec<Line<'static>>) -> Text<'static> {
    Text {
        lines,
        alignment: Some(Alignment::Left),
        style: Style::default(),
    }
}

fn wrap_with_prefixes(
    text: &str,
    width: usize,
    first_prefix: &str,
    rest_prefix: &str,
    style: Style,
) -> Vec<Line<'static>> {
    if text.trim().is_empty() {
        return vec![Line::from(Span::styled(String::new(), style))];
    }

    if width == 0 {
        let mut line = String::with_capacity(first_prefix.len() + text.len());
        line.push_str(first_prefix);
        line.push_str(text);
        return vec![Line::from(Span::styled(line, style))];
    }

    let min_width = first_prefix
        .chars()
        .count()
        .max(rest_prefix.chars().count())
        .saturating_add(1);
    let wrap_width = width.max(min_width);
    let options = WrapOptions::new(wrap_width)
        .break_words(false)
        .initial_indent(first_prefix)
        .subsequent_indent(rest_prefix);

    wrap(text, options)
        .into_iter()
        .map(|cow| Line::from(Span::styled(cow.into_owned(), style)))
        .collect()
}

fn wrap_plain(text: &str, width: usize, style: Style) -> Vec<Line<'static>> {
    wrap_with_prefixes(text, width, "", "", style)
}

fn pad_lines_to_width(lines: &mut [Line<'static>], width: u16) {
    let width = width as usize;
    if width == 0 {
        return;
    }

    for line in lines {
        let current_width: usize = line
            .spans
            .iter()
            .map(|span| UnicodeWidthStr::width(span.content.as_ref()))
            .sum();
        if current_width >= width {
            continue;
        }
        let pad_style = line.spans.last().map(|span| span.style).unwrap_or_default();
        let padding = " ".repeat(width - current_width);
        line.spans.push(Span::styled(padding, pad_style));
    }
}

fn line_visual_height(line: &Line<'_>, width: u16) -> usize {
    if width == 0 {
        return 0;
    }
    let width = width as usize;
    let content_width: usize = line
        .spans
        .iter()
        .map(|span| UnicodeWidthStr::width(span.content.as_ref()))
        .sum();
    if content_width == 0 {
        1
    } else {
        content_width.div_ceil(width)
    }
}

fn visual_height(lines: &[Line<'_>], width: u16) -> usize {
    lines
        .iter()
        .map(|line| line_visual_height(line, width))
        .sum()
}

/// Picks the rows to show: starts at `offset`, scrolls just enough to keep
/// `selected` on screen, then fills `available` lines.
fn fit_rows(heights: &[usize], selected: usize, offset: usize, available: usize) -> Range<usize> {
    if heights.is_empty() {
        return 0..0;
    }
    let selected = selected.min(heights.len() - 1);
    let mut offset = offset.min(selected);
    while offset < selected && heights[offset..=selected].iter().sum::<usize>() > available {
        offset += 1;
    }

    let mut end = offset;
    let mut used = 0usize;
    while end < heights.len() {
        let height = heights[end];
        if used > 0 && used + height > available {
            break;
        }
        used += height;
        end += 1;
        if used >= available {
            break;
        }
    }
    offset..end
}

fn panel_block(title: String, focused: bool) -> Block<'static> {
    let border_style = if focused {
        Style::default().fg(COLOR_BORDER_FOCUSED)
    } else {
        Style::default().fg(COLOR_BORDER_IDLE)
    };
    let title_style = if focused {
        Style::default()
            .fg(COLOR_ACCENT)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(COLOR_TEXT_SECONDARY)
    };
    Block::default()
        .title(Span::styled(title, title_style))
        .borders(Borders::ALL)
        .border_style(border_style)
        .style(Style::default().bg(COLOR_PANEL_BG))
        .padding(Padding::horizontal(1))
}

fn popup_block(title: &str, color: Color) -> Block<'static> {
    Block::default()
        .title(Span::styled(
            title.to_string(),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(color))
        .style(Style::default().bg(COLOR_PANEL_BG))
        .padding(Padding::uniform(1))
}

fn post_age(post: &Post) -> String {
    post.created
        .clone()
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| format::age_label(post.created_date))
}

fn post_lines(post: &Post, width: usize, highlight: bool) -> Vec<Line<'static>> {
    let background = if highlight {
        COLOR_PANEL_SELECTED_BG
    } else {
        COLOR_PANEL_BG
    };
    let meta_style = Style::default()
        .fg(COLOR_ACCENT)
        .bg(background)
        .add_modifier(Modifier::BOLD);
    let body_style = Style::default().fg(COLOR_TEXT_SECONDARY).bg(background);

    let mut header = format::display_name(post.user.as_ref());
    let age = post_age(post);
    if !age.is_empty() {
        header.push_str(" · ");
        header.push_str(&age);
    }
    let snippet = post
        .content
        .lines()
        .map(|line| line.trim().trim_start_matches('#').trim())
        .find(|line| !line.is_empty())
        .unwrap_or("(no text)");

    let mut lines = wrap_plain(&header, width, meta_style);
    lines.extend(wrap_plain(snippet, width, body_style).into_iter().take(2));
    lines.push(Line::from(Span::styled(String::new(), body_style)));
    pad_lines_to_width(&mut lines, width as u16);
    lines
}

fn comment_lines(
    comment: &Comment,
    reply: bool,
    own: bool,
    body: Option<&Text<'static>>,
    width: usize,
    meta_style: Style,
    body_style: Style,
) -> Vec<Line<'static>> {
    let indent = if reply { REPLY_INDENT } else { "" };
    let body_prefix = format!("{indent}  ");

    let mut header = format!(
        "[{}] {}",
        format::initials(comment.user.as_ref()),
        format::display_name(comment.user.as_ref())
    );
    if reply {
        if let Some(parent) = comment
            .parent_user
            .as_ref()
            .filter(|user| !user.username.is_empty())
        {
            header.push_str(&format!(" ↳ @{}", parent.username));
        }
    }
    if own {
        header.push_str(" · you");
    }
    let age = format::age_label(comment.created_at);
    if !age.is_empty() {
        header.push_str(" · ");
        header.push_str(&age);
    }

    let mut lines = wrap_with_prefixes(&header, width, indent, indent, meta_style);
    match body {
        Some(body) if !body.lines.is_empty() => {
            for line in &body.lines {
                let mut spans = vec![Span::styled(body_prefix.clone(), body_style)];
                spans.extend(
                    line.spans
                        .iter()
                        .map(|span| Span::styled(span.content.clone(), body_style.patch(span.style))),
                );
                lines.push(Line::from(spans));
            }
        }
        _ => lines.extend(wrap_with_prefixes(
            "(empty comment)",
            width,
            &body_prefix,
            &body_prefix,
            body_style,
        )),
    }
    lines.push(Line::from(Span::styled(String::new(), body_style)));
    lines
}

fn friend_lines(profile: &Profile, list: FriendList, width: usize, highlight: bool) -> Vec<Line<'static>> {
    let background = if highlight {
        COLOR_PANEL_SELECTED_BG
    } else {
        COLOR_PANEL_BG
    };
    let name_style = Style::default()
        .fg(COLOR_TEXT_PRIMARY)
        .bg(background)
        .add_modifier(Modifier::BOLD);
    let detail_style = Style::default().fg(COLOR_TEXT_SECONDARY).bg(background);

    let snapshot = profile.snapshot();
    let mut header = format!(
        "[{}] {}",
        format::initials(Some(&snapshot)),
        format::profile_name(profile)
    );
    if !profile.username.is_empty() {
        header.push_str(&format!("  @{}", profile.username));
    }
    let detail = match list {
        FriendList::Friends => profile
            .city
            .clone()
            .filter(|city| !city.trim().is_empty())
            .unwrap_or_else(|| "Friend".to_string()),
        FriendList::Pending => "Wants to be your friend".to_string(),
        FriendList::Suggestions => {
            let mut detail = match profile.mutual_friends {
                0 => "No mutual friends".to_string(),
                1 => "1 mutual friend".to_string(),
                n => format!("{n} mutual friends"),
            };
            if profile.request_sent {
                detail.push_str(" · request sent");
            }
            detail
        }
    };

    let mut lines = wrap_plain(&header, width, name_style);
    lines.extend(wrap_plain(&detail, width, detail_style));
    lines.push(Line::from(Span::styled(String::new(), detail_style)));
    pad_lines_to_width(&mut lines, width as u16);
    lines
}

fn profile_lines(profile: &Profile) -> Vec<Line<'static>> {
    let label = Style::default().fg(COLOR_TEXT_SECONDARY);
    let value = Style::default().fg(COLOR_TEXT_PRIMARY);
    let mut lines = vec![
        Line::from(Span::styled(
            format::profile_name(profile),
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::styled(format!("@{}", profile.username), label)),
        Line::from(""),
    ];
    let fields = [
        ("Email", profile.email.as_deref()),
        ("City", profile.city.as_deref()),
        ("Born", profile.dob.as_deref()),
    ];
    for (name, field) in fields {
        if let Some(field) = field.filter(|field| !field.trim().is_empty()) {
            lines.push(Line::from(vec![
                Span::styled(format!("{name}: "), label),
                Span::styled(field.to_string(), value),
            ]));
        }
    }
    if profile.mutual_friends > 0 {
        lines.push(Line::from(Span::styled(
            format!("{} mutual friends", profile.mutual_friends),
            value,
        )));
    }
    lines
}

fn list_status(pager: &Paginator, count: usize, spinner: &str, empty: &str) -> Option<String> {
    match pager.state() {
        LoadState::Loading if count == 0 => Some(format!("{spinner} Loading…")),
        LoadState::Loading => Some(format!("{spinner} Loading more…")),
        LoadState::Error { message, .. } => Some(format!("{message} · R to retry")),
        LoadState::Idle if count == 0 => Some(empty.to_string()),
        LoadState::Idle if !pager.has_more() => Some("You're all caught up".to_string()),
        LoadState::Idle => None,
    }
}

#[derive(Clone)]
pub struct Options {
    pub status_message: String,
    pub page_size: u32,
    pub feed_service: Arc<dyn FeedService + Send + Sync>,
    pub comment_service: Arc<dyn CommentService + Send + Sync>,
    pub friend_service: Arc<dyn FriendService + Send + Sync>,
    pub profile_service: Arc<dyn ProfileService + Send + Sync>,
    pub session: Arc<dyn AuthSession>,
}

pub struct Model {
    status_message: String,
    view: View,
    focused_pane: Pane,
    page_size: u32,
    feed: PagedList<Post>,
    selected_post: usize,
    post_offset: usize,
    post_visible: Range<usize>,
    content: Text<'static>,
    content_scroll: u16,
    renderer: Renderer,
    section: Option<CommentSection>,
    comment_section_id: u64,
    comment_sentinel: Sentinel,
    comment_rows: Vec<CommentRow>,
    comment_bodies: HashMap<String, (String, Text<'static>)>,
    selected_comment: usize,
    comment_offset: usize,
    comment_visible: Range<usize>,
    friends: PagedList<Profile>,
    friend_tab: FriendList,
    selected_friend: usize,
    friend_offset: usize,
    friend_visible: Range<usize>,
    composer: Option<Composer>,
    profile_popup: Option<Profile>,
    pending_delete: Option<String>,
    pending_remove: Option<String>,
    pending_actions: usize,
    pending_mention: Option<u64>,
    mention_cycle: usize,
    me: Option<Profile>,
    signed_out: bool,
    feed_service: Arc<dyn FeedService + Send + Sync>,
    comment_service: Arc<dyn CommentService + Send + Sync>,
    friend_service: Arc<dyn FriendService + Send + Sync>,
    profile_service: Arc<dyn ProfileService + Send + Sync>,
    session: Arc<dyn AuthSession>,
    resolver: Arc<MentionResolver>,
    needs_redraw: bool,
    spinner: Spinner,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
    next_request_id: u64,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        let page_size = opts.page_size.max(1);
        let resolver = Arc::new(MentionResolver::new(opts.profile_service.clone()));
        let mut model = Self {
            status_message: opts.status_message,
            view: View::Feed,
            focused_pane: Pane::Posts,
            page_size,
            // The feed endpoint counts pages from one.
            feed: PagedList::with_base(page_size, 1),
            selected_post: 0,
            post_offset: 0,
            post_visible: 0..0,
            content: text_with_lines(Vec::new()),
            content_scroll: 0,
            renderer: Renderer::new(),
            section: None,
            comment_section_id: 0,
            comment_sentinel: Sentinel::new(),
            comment_rows: Vec::new(),
            comment_bodies: HashMap::new(),
            selected_comment: 0,
            comment_offset: 0,
            comment_visible: 0..0,
            friends: PagedList::new(page_size),
            friend_tab: FriendList::Friends,
            selected_friend: 0,
            friend_offset: 0,
            friend_visible: 0..0,
            composer: None,
            profile_popup: None,
            pending_delete: None,
            pending_remove: None,
            pending_actions: 0,
            pending_mention: None,
            mention_cycle: 0,
            me: None,
            signed_out: false,
            feed_service: opts.feed_service,
            comment_service: opts.comment_service,
            friend_service: opts.friend_service,
            profile_service: opts.profile_service,
            session: opts.session,
            resolver,
            needs_redraw: true,
            spinner: Spinner::new(),
            response_tx,
            response_rx,
            next_request_id: 1,
        };

        if model.session.is_authenticated() {
            model.spawn_me();
            if let Some(request) = model.feed.begin_initial() {
                model.spawn_feed(request);
            }
        } else {
            model.signed_out = true;
            model.status_message = "Not signed in".to_string();
        }
        model
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        let tick_rate = Duration::from_millis(120);

        loop {
            if self.poll_async() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
                self.check_sentinels();
            }

            let timeout = tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {err:#}");
                            }
                        }
                        self.mark_dirty();
                    }
                } else {
                    self.mark_dirty();
                }
            }

            if last_tick.elapsed() >= tick_rate {
                last_tick = Instant::now();
                if self.is_loading() {
                    if self.spinner.advance() {
                        self.mark_dirty();
                    }
                } else {
                    self.spinner.reset();
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn is_loading(&self) -> bool {
        self.feed.pager().is_loading()
            || self.friends.pager().is_loading()
            || self
                .section
                .as_ref()
                .is_some_and(|section| section.pager().is_loading())
            || self.pending_actions > 0
            || self.pending_mention.is_some()
    }

    fn allocate_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    fn spawn_me(&self) {
        let service = self.profile_service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.my_profile();
            let _ = tx.send(AsyncResponse::Me { result });
        });
    }

    fn spawn_feed(&self, request: PageRequest) {
        debug!(page = request.server_page, "requesting feed page");
        let service = self.feed_service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.load_feed(request.server_page, request.size);
            let _ = tx.send(AsyncResponse::Feed { request, result });
        });
    }

    fn spawn_comments(&self, request: PageRequest) {
        let Some(section) = &self.section else {
            return;
        };
        let service = section.service();
        let post_id = section.post_id().to_string();
        let section_id = self.comment_section_id;
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = comments::fetch_page(service.as_ref(), &post_id, &request);
            let _ = tx.send(AsyncResponse::Comments {
                section_id,
                request,
                result,
            });
        });
    }

    fn spawn_friends(&self, list: FriendList, request: PageRequest) {
        let service = self.friend_service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = service.load_list(list, request.server_page, request.size);
            let _ = tx.send(AsyncResponse::Friends {
                list,
                request,
                result,
            });
        });
    }

    fn poll_async(&mut self) -> bool {
        let mut changed = false;
        while let Ok(message) = self.response_rx.try_recv() {
            self.handle_async_response(message);
            changed = true;
        }
        changed
    }

    /// True (and the UI switched to the signed-out screen) when `err` means
    /// the session is gone.
    fn check_signed_out(&mut self, err: &anyhow::Error) -> bool {
        if !api::is_unauthorized(err) && self.session.is_authenticated() {
            return false;
        }
        if !self.signed_out {
            warn!(error = %format!("{err:#}"), "session rejected by the server");
        }
        self.signed_out = true;
        self.composer = None;
        self.profile_popup = None;
        self.status_message = "Session expired".to_string();
        true
    }

    fn handle_async_response(&mut self, message: AsyncResponse) {
        match message {
            AsyncResponse::Feed { request, result } => {
                if let Err(err) = &result {
                    if self.check_signed_out(err) {
                        return;
                    }
                }
                let result = result.map_err(|err| format!("{err:#}"));
                let failed = result.as_ref().err().cloned();
                if !self.feed.finish(&request, result) {
                    return;
                }
                match failed {
                    Some(message) => {
                        warn!(page = request.number, error = %message, "feed page failed");
                        self.status_message = "Could not load the feed".to_string();
                    }
                    None => {
                        self.status_message = format!("{} posts", self.feed.len());
                        if request.number == 0 {
                            self.selected_post = 0;
                            self.post_offset = 0;
                            self.open_selected_post();
                        }
                    }
                }
            }
            AsyncResponse::Comments {
                section_id,
                request,
                result,
            } => {
                if section_id != self.comment_section_id {
                    debug!(section_id, "dropping comments for a closed post");
                    return;
                }
                if let Err(err) = &result {
                    if self.check_signed_out(err) {
                        return;
                    }
                }
                let Some(section) = self.section.as_mut() else {
                    return;
                };
                if !section.finish(&request, result) {
                    return;
                }
                if let Some(message) = section.pager().error() {
                    warn!(post = %section.post_id(), error = %message, "comment page failed");
                }
                // Re-arm the sentinel even if the page added no visible rows.
                self.comment_sentinel.disconnect();
                self.rebuild_comment_rows();
            }
            AsyncResponse::Friends {
                list,
                request,
                result,
            } => {
                if list != self.friend_tab {
                    return;
                }
                if let Err(err) = &result {
                    if self.check_signed_out(err) {
                        return;
                    }
                }
                let result = result.map_err(|err| format!("{err:#}"));
                if self.friends.finish(&request, result) {
                    self.selected_friend = self
                        .selected_friend
                        .min(self.friends.len().saturating_sub(1));
                }
            }
            AsyncResponse::CommentCreated { section_id, result } => {
                self.pending_actions = self.pending_actions.saturating_sub(1);
                match result {
                    Ok(comment) => {
                        if section_id != self.comment_section_id {
                            return;
                        }
                        let Some(section) = self.section.as_mut() else {
                            return;
                        };
                        let id = comment.id.clone();
                        section.apply_created(comment);
                        info!(comment = %id, "comment posted");
                        self.rebuild_comment_rows();
                        if let Some(index) = self.comment_rows.iter().position(|row| row.id == id)
                        {
                            self.selected_comment = index;
                        }
                        self.status_message = "Comment posted".to_string();
                    }
                    Err(err) => {
                        if !self.check_signed_out(&err) {
                            self.status_message = format!("Could not post comment: {err:#}");
                        }
                    }
                }
            }
            AsyncResponse::CommentUpdated {
                section_id,
                id,
                content,
                result,
            } => {
                self.pending_actions = self.pending_actions.saturating_sub(1);
                match result {
                    Ok(updated) => {
                        if section_id != self.comment_section_id {
                            return;
                        }
                        let content = if updated.content.trim().is_empty() {
                            content
                        } else {
                            updated.content
                        };
                        if let Some(section) = self.section.as_mut() {
                            section.apply_updated(&id, &content);
                        }
                        self.rebuild_comment_rows();
                        self.status_message = "Comment updated".to_string();
                    }
                    Err(err) => {
                        if !self.check_signed_out(&err) {
                            self.status_message = format!("Could not update comment: {err:#}");
                        }
                    }
                }
            }
            AsyncResponse::CommentDeleted {
                section_id,
                id,
                result,
            } => {
                self.pending_actions = self.pending_actions.saturating_sub(1);
                match result {
                    Ok(()) => {
                        if section_id != self.comment_section_id {
                            return;
                        }
                        if let Some(section) = self.section.as_mut() {
                            section.apply_deleted(&id);
                        }
                        self.rebuild_comment_rows();
                        self.status_message = "Comment deleted".to_string();
                    }
                    Err(err) => {
                        if !self.check_signed_out(&err) {
                            self.status_message = format!("Could not delete comment: {err:#}");
                        }
                    }
                }
            }
            AsyncResponse::FriendAction {
                list,
                user_id,
                name,
                action,
                result,
            } => {
                self.pending_actions = self.pending_actions.saturating_sub(1);
                if let Err(err) = result {
                    if !self.check_signed_out(&err) {
                        self.status_message = format!("{err:#}");
                    }
                    return;
                }
                self.status_message = format!("{} {}", action.done(), name);
                if list != self.friend_tab {
                    return;
                }
                if action == FriendAction::Send {
                    if let Some(profile) = self.friends.iter_mut().find(|p| p.id == user_id) {
                        profile.request_sent = true;
                    }
                } else {
                    self.friends.remove_where(|profile| profile.id == user_id);
                    self.selected_friend = self
                        .selected_friend
                        .min(self.friends.len().saturating_sub(1));
                }
            }
            AsyncResponse::Me { result } => match result {
                Ok(profile) => {
                    info!(user = %profile.username, "signed in");
                    if let Some(section) = self.section.as_mut() {
                        section.set_current_user(Some(profile.snapshot()));
                    }
                    self.me = Some(profile);
                }
                Err(err) => {
                    if !self.check_signed_out(&err) {
                        warn!(error = %format!("{err:#}"), "could not load own profile");
                    }
                }
            },
            AsyncResponse::Mention {
                request_id,
                username,
                result,
            } => {
                if self.pending_mention != Some(request_id) {
                    return;
                }
                self.pending_mention = None;
                match result {
                    Ok(Some(profile)) => {
                        self.status_message = format!("@{username}");
                        self.profile_popup = Some(profile);
                    }
                    Ok(None) => {
                        self.status_message = format!("No user named @{username}");
                    }
                    Err(err) => {
                        if !self.check_signed_out(&err) {
                            self.status_message = format!("Could not open @{username}: {err:#}");
                        }
                    }
                }
            }
        }
    }

    /// Runs after every draw: each list's last visible row decides whether
    /// the next page is requested.
    fn check_sentinels(&mut self) {
        if self.signed_out {
            return;
        }
        match self.view {
            View::Feed => {
                if let Some(request) = self.feed.on_scroll(self.post_visible.clone()) {
                    self.spawn_feed(request);
                    self.mark_dirty();
                }

                self.comment_sentinel
                    .observe(self.comment_rows.len().checked_sub(1));
                let mut request = None;
                if let Some(section) = self.section.as_mut() {
                    let loading = section.pager().is_loading();
                    let has_more = section.pager().has_more();
                    self.comment_sentinel.check(
                        self.comment_visible.clone(),
                        loading,
                        has_more,
                        || request = section.begin_next(),
                    );
                }
                if let Some(request) = request {
                    debug!(page = request.number, "requesting next comment page");
                    self.spawn_comments(request);
                    self.mark_dirty();
                }
            }
            View::Friends => {
                if let Some(request) = self.friends.on_scroll(self.friend_visible.clone()) {
                    self.spawn_friends(self.friend_tab, request);
                    self.mark_dirty();
                }
            }
        }
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        if self.signed_out {
            return Ok(matches!(code, KeyCode::Char('q') | KeyCode::Esc));
        }
        if self.composer.is_some() {
            return self.handle_composer_key(code);
        }
        if self.profile_popup.is_some() {
            if matches!(code, KeyCode::Esc | KeyCode::Enter | KeyCode::Char('q')) {
                self.profile_popup = None;
            }
            return Ok(false);
        }
        if code != KeyCode::Char('d') {
            self.pending_delete = None;
        }
        if code != KeyCode::Char('x') {
            self.pending_remove = None;
        }

        match self.view {
            View::Feed => self.handle_feed_key(code),
            View::Friends => self.handle_friends_key(code),
        }
    }

    fn handle_feed_key(&mut self, code: KeyCode) -> Result<bool> {
        match code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('f') => self.open_friends(),
            KeyCode::Left | KeyCode::Char('h') => self.focused_pane = self.focused_pane.previous(),
            KeyCode::Right | KeyCode::Char('l') | KeyCode::Tab => {
                self.focused_pane = self.focused_pane.next()
            }
            KeyCode::Down | KeyCode::Char('j') => self.navigate(1),
            KeyCode::Up | KeyCode::Char('k') => self.navigate(-1),
            KeyCode::PageDown => self.navigate(CONTENT_PAGE_STEP as i32),
            KeyCode::PageUp => self.navigate(-(CONTENT_PAGE_STEP as i32)),
            KeyCode::Char('R') => self.retry_focused(),
            KeyCode::Char('r') if self.focused_pane == Pane::Posts => self.reload_feed(),
            KeyCode::Char('r') => self.open_composer_reply(),
            KeyCode::Char('c') => self.open_composer(ComposerMode::New),
            KeyCode::Char('e') => self.open_composer_edit(),
            KeyCode::Char('d') if self.focused_pane == Pane::Comments => {
                self.delete_selected_comment()?
            }
            KeyCode::Char('m') if self.focused_pane == Pane::Comments => self.open_mention(),
            _ => {}
        }
        Ok(false)
    }

    fn handle_friends_key(&mut self, code: KeyCode) -> Result<bool> {
        match code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Esc | KeyCode::Char('f') => {
                self.view = View::Feed;
                self.status_message = "Feed".to_string();
            }
            KeyCode::Tab => {
                self.friend_tab = self.friend_tab.next();
                self.reload_friends();
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if !self.friends.is_empty() {
                    self.selected_friend = (self.selected_friend + 1).min(self.friends.len() - 1);
                }
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected_friend = self.selected_friend.saturating_sub(1);
            }
            KeyCode::Enter => {
                self.profile_popup = self.friends.get(self.selected_friend).cloned();
            }
            KeyCode::Char('r') => self.reload_friends(),
            KeyCode::Char('R') => {
                if let Some(request) = self.friends.retry() {
                    self.spawn_friends(self.friend_tab, request);
                }
            }
            KeyCode::Char('a') => self.run_friend_action(FriendAction::Accept),
            KeyCode::Char('s') => self.run_friend_action(FriendAction::Send),
            KeyCode::Char('x') if self.friend_tab == FriendList::Pending => {
                self.run_friend_action(FriendAction::Reject)
            }
            KeyCode::Char('x') => self.run_friend_action(FriendAction::Remove),
            _ => {}
        }
        Ok(false)
    }

    fn handle_composer_key(&mut self, code: KeyCode) -> Result<bool> {
        let Some(composer) = self.composer.as_mut() else {
            return Ok(false);
        };
        match code {
            KeyCode::Esc => {
                self.composer = None;
                self.status_message = "Discarded draft".to_string();
            }
            KeyCode::Enter => self.submit_composer()?,
            KeyCode::Tab => composer.buffer.push('\n'),
            KeyCode::Backspace => {
                composer.buffer.pop();
            }
            KeyCode::Char(ch) => composer.buffer.push(ch),
            _ => {}
        }
        Ok(false)
    }

    fn navigate(&mut self, delta: i32) {
        match self.focused_pane {
            Pane::Posts => {
                if self.feed.is_empty() {
                    return;
                }
                let last = self.feed.len() - 1;
                let target = step(self.selected_post, delta, last);
                if target != self.selected_post {
                    self.selected_post = target;
                    self.open_selected_post();
                }
            }
            Pane::Content => {
                let amount = delta.unsigned_abs().min(u16::MAX as u32) as u16;
                self.content_scroll = if delta < 0 {
                    self.content_scroll.saturating_sub(amount)
                } else {
                    self.content_scroll.saturating_add(amount)
                };
            }
            Pane::Comments => {
                if self.comment_rows.is_empty() {
                    return;
                }
                let last = self.comment_rows.len() - 1;
                let target = step(self.selected_comment, delta, last);
                if target != self.selected_comment {
                    self.selected_comment = target;
                    self.mention_cycle = 0;
                }
            }
        }
    }

    fn reload_feed(&mut self) {
        self.feed.reset();
        self.selected_post = 0;
        self.post_offset = 0;
        self.post_visible = 0..0;
        if let Some(request) = self.feed.begin_initial() {
            self.status_message = "Refreshing feed…".to_string();
            self.spawn_feed(request);
        }
    }

    fn retry_focused(&mut self) {
        match self.focused_pane {
            Pane::Posts => {
                if let Some(request) = self.feed.retry() {
                    self.spawn_feed(request);
                }
            }
            Pane::Content | Pane::Comments => {
                let request = self.section.as_mut().and_then(CommentSection::retry);
                if let Some(request) = request {
                    self.spawn_comments(request);
                }
            }
        }
    }

    fn open_selected_post(&mut self) {
        self.comment_section_id = self.comment_section_id.wrapping_add(1);
        self.comment_sentinel.disconnect();
        self.comment_rows.clear();
        self.comment_bodies.clear();
        self.selected_comment = 0;
        self.comment_offset = 0;
        self.comment_visible = 0..0;
        self.content_scroll = 0;
        self.pending_delete = None;
        self.mention_cycle = 0;

        let Some(post) = self.feed.get(self.selected_post).cloned() else {
            self.section = None;
            self.content = text_with_lines(Vec::new());
            return;
        };
        self.content = self.post_text(&post);

        let mut section = CommentSection::new(
            post.id.clone(),
            self.page_size,
            self.comment_service.clone(),
            self.me.as_ref().map(Profile::snapshot),
        );
        let request = section.begin_initial();
        self.section = Some(section);
        if let Some(request) = request {
            self.spawn_comments(request);
        }
    }

    fn post_text(&self, post: &Post) -> Text<'static> {
        let mut header = vec![Span::styled(
            format::display_name(post.user.as_ref()),
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::BOLD),
        )];
        let age = post_age(post);
        if !age.is_empty() {
            header.push(Span::styled(
                format!(" · {age}"),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            ));
        }
        if let Some(visibility) = post.visibility.as_deref().filter(|v| !v.is_empty()) {
            header.push(Span::styled(
                format!(" · {}", visibility.to_lowercase()),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            ));
        }
        let mut lines = vec![Line::from(header), Line::from("")];
        lines.extend(self.renderer.render(&post.content).lines);
        text_with_lines(lines)
    }

    fn rebuild_comment_rows(&mut self) {
        let Some(section) = &self.section else {
            self.comment_rows.clear();
            return;
        };

        let mut rows = Vec::new();
        for thread in section.threads() {
            rows.push(CommentRow {
                id: thread.root.id.clone(),
                reply: false,
            });
            rows.extend(thread.replies.iter().map(|reply| CommentRow {
                id: reply.id.clone(),
                reply: true,
            }));
        }

        let store = section.store();
        let renderer = &self.renderer;
        let bodies = &mut self.comment_bodies;
        bodies.retain(|id, _| store.get(id).is_some());
        for comment in store.comments() {
            let stale = bodies
                .get(&comment.id)
                .map_or(true, |(source, _)| source != &comment.content);
            if stale {
                bodies.insert(
                    comment.id.clone(),
                    (comment.content.clone(), renderer.render(&comment.content)),
                );
            }
        }

        self.comment_rows = rows;
        self.selected_comment = self
            .selected_comment
            .min(self.comment_rows.len().saturating_sub(1));
    }

    fn selected_comment_entry(&self) -> Option<&Comment> {
        let row = self.comment_rows.get(self.selected_comment)?;
        self.section.as_ref()?.store().get(&row.id)
    }

    fn open_composer(&mut self, mode: ComposerMode) {
        if self.section.is_none() {
            self.status_message = "Select a post first".to_string();
            return;
        }
        self.focused_pane = Pane::Comments;
        self.composer = Some(Composer {
            mode,
            buffer: String::new(),
        });
    }

    fn open_composer_reply(&mut self) {
        let Some(comment) = self.selected_comment_entry() else {
            self.status_message = "Select a comment to reply to".to_string();
            return;
        };
        let parent_id = comment.id.clone();
        let buffer = comment
            .user
            .as_ref()
            .filter(|user| !user.username.is_empty())
            .map(|user| format!("@{} ", user.username))
            .unwrap_or_default();
        self.composer = Some(Composer {
            mode: ComposerMode::Reply { parent_id },
            buffer,
        });
    }

    fn open_composer_edit(&mut self) {
        let Some(section) = &self.section else {
            return;
        };
        let Some(comment) = self.selected_comment_entry() else {
            return;
        };
        if !section.is_own(comment) {
            self.status_message = "You can only edit your own comments".to_string();
            return;
        }
        self.composer = Some(Composer {
            mode: ComposerMode::Edit {
                id: comment.id.clone(),
            },
            buffer: comment.content.clone(),
        });
    }

    fn submit_composer(&mut self) -> Result<()> {
        let Some(composer) = self.composer.take() else {
            return Ok(());
        };
        let content = composer.buffer.trim().to_string();
        if content.is_empty() {
            self.status_message = "Comment text is required".to_string();
            self.composer = Some(composer);
            return Ok(());
        }
        let Some(section) = &self.section else {
            bail!("no post selected");
        };

        let service = section.service();
        let section_id = self.comment_section_id;
        let tx = self.response_tx.clone();
        match composer.mode {
            ComposerMode::New | ComposerMode::Reply { .. } => {
                let parent = match &composer.mode {
                    ComposerMode::Reply { parent_id } => Some(
                        section
                            .store()
                            .get(parent_id)
                            .cloned()
                            .context("the comment you replied to is gone")?,
                    ),
                    _ => None,
                };
                let draft = section.draft(&content, parent.as_ref())?;
                thread::spawn(move || {
                    let result = service.create_comment(&draft);
                    let _ = tx.send(AsyncResponse::CommentCreated { section_id, result });
                });
                self.status_message = "Posting comment…".to_string();
            }
            ComposerMode::Edit { id } => {
                thread::spawn(move || {
                    let result = service.update_comment(&id, &content);
                    let _ = tx.send(AsyncResponse::CommentUpdated {
                        section_id,
                        id,
                        content,
                        result,
                    });
                });
                self.status_message = "Saving comment…".to_string();
            }
        }
        self.pending_actions += 1;
        Ok(())
    }

    fn delete_selected_comment(&mut self) -> Result<()> {
        let Some(comment) = self.selected_comment_entry().cloned() else {
            return Ok(());
        };
        let Some(section) = &self.section else {
            return Ok(());
        };
        if !section.is_own(&comment) {
            self.status_message = "You can only delete your own comments".to_string();
            return Ok(());
        }
        if self.pending_delete.as_deref() != Some(comment.id.as_str()) {
            self.pending_delete = Some(comment.id);
            self.status_message = "Press d again to delete this comment".to_string();
            return Ok(());
        }

        self.pending_delete = None;
        let service = section.service();
        let section_id = self.comment_section_id;
        let tx = self.response_tx.clone();
        let id = comment.id;
        thread::spawn(move || {
            let result = service.delete_comment(&id);
            let _ = tx.send(AsyncResponse::CommentDeleted {
                section_id,
                id,
                result,
            });
        });
        self.pending_actions += 1;
        self.status_message = "Deleting comment…".to_string();
        Ok(())
    }

    fn open_mention(&mut self) {
        let Some(comment) = self.selected_comment_entry().cloned() else {
            return;
        };
        let document = self.renderer.parse(&comment.content);
        let mentions = document.mentions();
        if mentions.is_empty() {
            self.status_message = "No mentions in this comment".to_string();
            return;
        }
        let username = mentions[self.mention_cycle % mentions.len()].to_string();
        self.mention_cycle = self.mention_cycle.wrapping_add(1);

        let request_id = self.allocate_request_id();
        self.pending_mention = Some(request_id);
        self.status_message = format!("Looking up @{username}…");
        let resolver = self.resolver.clone();
        let profiles = self.profile_service.clone();
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = match resolver.resolve_in(&username, &comment) {
                Some(id) => profiles.profile(&id).map(Some),
                None => Ok(None),
            };
            let _ = tx.send(AsyncResponse::Mention {
                request_id,
                username,
                result,
            });
        });
    }

    fn open_friends(&mut self) {
        self.view = View::Friends;
        self.status_message = self.friend_tab.label().to_string();
        if self.friends.is_empty() && !self.friends.pager().is_loading() {
            self.reload_friends();
        }
    }

    fn reload_friends(&mut self) {
        self.friends.reset();
        self.selected_friend = 0;
        self.friend_offset = 0;
        self.friend_visible = 0..0;
        self.pending_remove = None;
        self.status_message = self.friend_tab.label().to_string();
        if let Some(request) = self.friends.begin_initial() {
            self.spawn_friends(self.friend_tab, request);
        }
    }

    fn run_friend_action(&mut self, action: FriendAction) {
        if !action.applies_to(self.friend_tab) {
            return;
        }
        let Some(profile) = self.friends.get(self.selected_friend).cloned() else {
            return;
        };
        let name = format::profile_name(&profile);
        if action == FriendAction::Send && profile.request_sent {
            self.status_message = format!("Already sent a request to {name}");
            return;
        }
        if action == FriendAction::Remove && self.pending_remove.as_deref() != Some(profile.id.as_str()) {
            self.pending_remove = Some(profile.id);
            self.status_message = format!("Press x again to remove {name}");
            return;
        }
        self.pending_remove = None;

        let service = self.friend_service.clone();
        let tx = self.response_tx.clone();
        let list = self.friend_tab;
        let user_id = profile.id;
        thread::spawn(move || {
            let result = action.run(service.as_ref(), &user_id);
            let _ = tx.send(AsyncResponse::FriendAction {
                list,
                user_id,
                name,
                action,
                result,
            });
        });
        self.pending_actions += 1;
    }

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let full = frame.size();
        frame.render_widget(Block::default().style(Style::default().bg(COLOR_BG)), full);

        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(full);

        let mut status_text = if self.is_loading() {
            format!("{} {}", self.spinner.frame(), self.status_message)
                .trim()
                .to_string()
        } else {
            self.status_message.clone()
        };
        if let Some(me) = &self.me {
            status_text = format!("{status_text}  ·  @{}", me.username);
        }
        let status_line = Paragraph::new(status_text).style(
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .bg(COLOR_PANEL_FOCUSED_BG)
                .add_modifier(Modifier::BOLD),
        );
        frame.render_widget(status_line, layout[0]);

        match self.view {
            View::Feed => {
                let panes = Layout::default()
                    .direction(Direction::Horizontal)
                    .constraints([
                        Constraint::Percentage(28),
                        Constraint::Percentage(37),
                        Constraint::Percentage(35),
                    ])
                    .split(layout[1]);
                self.draw_posts(frame, panes[0]);
                self.draw_content(frame, panes[1]);
                self.draw_comments(frame, panes[2]);
            }
            View::Friends => self.draw_friends(frame, layout[1]),
        }

        let footer = Paragraph::new(self.footer_text())
            .style(
                Style::default()
                    .fg(COLOR_TEXT_SECONDARY)
                    .bg(COLOR_PANEL_BG)
                    .add_modifier(Modifier::ITALIC),
            )
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true });
        frame.render_widget(footer, layout[2]);

        if self.composer.is_some() {
            self.draw_composer(frame, layout[1]);
        }
        if let Some(profile) = &self.profile_popup {
            let area = centered_rect(50, 45, layout[1]);
            frame.render_widget(Clear, area);
            let popup = Paragraph::new(text_with_lines(profile_lines(profile)))
                .block(popup_block("Profile", COLOR_ACCENT))
                .wrap(Wrap { trim: false });
            frame.render_widget(popup, area);
        }
        if self.signed_out {
            self.draw_signed_out(frame, layout[1]);
        }
    }

    fn pane_block(&self, pane: Pane) -> Block<'static> {
        panel_block(pane.title().to_string(), self.focused_pane == pane)
    }

    fn draw_posts(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = self.pane_block(Pane::Posts);
        let inner = block.inner(area);
        let width = inner.width as usize;
        let focused = self.focused_pane == Pane::Posts;

        let rows: Vec<Vec<Line<'static>>> = self
            .feed
            .items()
            .iter()
            .enumerate()
            .map(|(index, post)| post_lines(post, width, focused && index == self.selected_post))
            .collect();
        let heights: Vec<usize> = rows
            .iter()
            .map(|lines| visual_height(lines, inner.width))
            .collect();

        let status_style = Style::default().fg(COLOR_TEXT_SECONDARY);
        let status_lines = list_status(
            self.feed.pager(),
            self.feed.len(),
            self.spinner.frame(),
            "Your feed is empty",
        )
        .map(|status| wrap_plain(&status, width, status_style))
        .unwrap_or_default();
        let available = (inner.height as usize).saturating_sub(status_lines.len());

        let visible = fit_rows(&heights, self.selected_post, self.post_offset, available);
        self.post_offset = visible.start;
        self.post_visible = visible.clone();

        let mut lines: Vec<Line<'static>> = rows
            .into_iter()
            .skip(visible.start)
            .take(visible.len())
            .flatten()
            .collect();
        lines.extend(status_lines);
        let paragraph = Paragraph::new(text_with_lines(lines))
            .block(block)
            .wrap(Wrap { trim: false });
        frame.render_widget(paragraph, area);
    }

    fn draw_content(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = self.pane_block(Pane::Content);
        let paragraph = Paragraph::new(self.content.clone())
            .block(block)
            .wrap(Wrap { trim: false })
            .scroll((self.content_scroll, 0));
        frame.render_widget(paragraph, area);
    }

    fn comment_status(&self) -> String {
        let Some(section) = &self.section else {
            return "Select a post to see its comments".to_string();
        };
        match section.pager().state() {
            LoadState::Loading if section.store().is_empty() => {
                format!("{} Loading comments…", self.spinner.frame())
            }
            LoadState::Loading => format!(
                "{} Loading more comments…",
                self.spinner.frame()
            ),
            LoadState::Error { message, .. } => {
                format!("Could not load comments: {message} · R to retry")
            }
            LoadState::Idle => {
                let store = section.store();
                if store.is_empty() {
                    return "No comments yet · c to write one".to_string();
                }
                let total = section.pager().cursor().total_elements.max(store.len() as u64);
                let mut status = format!("{} of {} comments", store.len(), total);
                let orphans = store.orphan_count();
                if orphans > 0 {
                    status.push_str(&format!(" · {orphans} replies waiting for their thread"));
                }
                status
            }
        }
    }

    fn draw_comments(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = self.pane_block(Pane::Comments);
        let inner = block.inner(area);
        let width = inner.width as usize;
        let focused = self.focused_pane == Pane::Comments;

        let status_style = Style::default()
            .fg(COLOR_TEXT_SECONDARY)
            .bg(COLOR_PANEL_BG)
            .add_modifier(Modifier::BOLD);
        let mut status_lines = wrap_plain(&self.comment_status(), width, status_style);
        status_lines.push(Line::from(Span::styled(String::new(), status_style)));

        let mut rows: Vec<Vec<Line<'static>>> = Vec::with_capacity(self.comment_rows.len());
        if let Some(section) = &self.section {
            for (index, row) in self.comment_rows.iter().enumerate() {
                let Some(comment) = section.store().get(&row.id) else {
                    rows.push(Vec::new());
                    continue;
                };
                let highlight = focused && index == self.selected_comment;
                let background = if highlight {
                    COLOR_PANEL_SELECTED_BG
                } else {
                    COLOR_PANEL_BG
                };
                let own = section.is_own(comment);
                let meta_color = if own { COLOR_SUCCESS } else { COLOR_ACCENT };
                let mut meta_style = Style::default().fg(meta_color).bg(background);
                if highlight {
                    meta_style = meta_style.add_modifier(Modifier::BOLD);
                }
                let body_style = Style::default().fg(COLOR_TEXT_PRIMARY).bg(background);
                let body = self.comment_bodies.get(&row.id).map(|(_, text)| text);
                let mut lines =
                    comment_lines(comment, row.reply, own, body, width, meta_style, body_style);
                pad_lines_to_width(&mut lines, inner.width);
                rows.push(lines);
            }
        }
        let heights: Vec<usize> = rows
            .iter()
            .map(|lines| visual_height(lines, inner.width))
            .collect();
        let available = (inner.height as usize).saturating_sub(status_lines.len());
        let visible = fit_rows(&heights, self.selected_comment, self.comment_offset, available);
        self.comment_offset = visible.start;
        self.comment_visible = visible.clone();

        let mut lines = status_lines;
        lines.extend(
            rows.into_iter()
                .skip(visible.start)
                .take(visible.len())
                .flatten(),
        );
        let paragraph = Paragraph::new(text_with_lines(lines))
            .block(block)
            .wrap(Wrap { trim: false });
        frame.render_widget(paragraph, area);
    }

    fn draw_friends(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = panel_block("Friends".to_string(), true);
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let sections = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(2), Constraint::Min(0)])
            .split(inner);

        let mut tabs: Vec<Span<'static>> = Vec::new();
        for (index, list) in FriendList::ALL.iter().enumerate() {
            if index > 0 {
                tabs.push(Span::styled(" │ ", Style::default().fg(COLOR_BORDER_IDLE)));
            }
            let style = if *list == self.friend_tab {
                Style::default()
                    .fg(COLOR_ACCENT)
                    .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
            } else {
                Style::default().fg(COLOR_TEXT_SECONDARY)
            };
            tabs.push(Span::styled(list.label().to_string(), style));
        }
        frame.render_widget(Paragraph::new(Line::from(tabs)), sections[0]);

        let list_area = sections[1];
        let width = list_area.width as usize;
        let rows: Vec<Vec<Line<'static>>> = self
            .friends
            .items()
            .iter()
            .enumerate()
            .map(|(index, profile)| {
                friend_lines(profile, self.friend_tab, width, index == self.selected_friend)
            })
            .collect();
        let heights: Vec<usize> = rows
            .iter()
            .map(|lines| visual_height(lines, list_area.width))
            .collect();
        let empty = match self.friend_tab {
            FriendList::Friends => "No friends yet · Tab for suggestions",
            FriendList::Pending => "No pending requests",
            FriendList::Suggestions => "No suggestions right now",
        };
        let status_lines = list_status(
            self.friends.pager(),
            self.friends.len(),
            self.spinner.frame(),
            empty,
        )
        .map(|status| wrap_plain(&status, width, Style::default().fg(COLOR_TEXT_SECONDARY)))
        .unwrap_or_default();
        let available = (list_area.height as usize).saturating_sub(status_lines.len());
        let visible = fit_rows(&heights, self.selected_friend, self.friend_offset, available);
        self.friend_offset = visible.start;
        self.friend_visible = visible.clone();

        let mut lines: Vec<Line<'static>> = rows
            .into_iter()
            .skip(visible.start)
            .take(visible.len())
            .flatten()
            .collect();
        lines.extend(status_lines);
        frame.render_widget(
            Paragraph::new(text_with_lines(lines)).wrap(Wrap { trim: false }),
            list_area,
        );
    }

    fn draw_composer(&self, frame: &mut Frame<'_>, area: Rect) {
        let Some(composer) = &self.composer else {
            return;
        };
        let popup_area = centered_rect(70, 60, area);
        frame.render_widget(Clear, popup_area);

        let input_style = Style::default().fg(COLOR_TEXT_PRIMARY);
        let mut lines: Vec<Line<'static>> = Vec::new();
        let mut buffer_lines: Vec<&str> = composer.buffer.split('\n').collect();
        let last = buffer_lines.pop().unwrap_or_default();
        for line in buffer_lines {
            lines.push(Line::from(Span::styled(line.to_string(), input_style)));
        }
        lines.push(Line::from(vec![
            Span::styled(last.to_string(), input_style),
            Span::styled("▏", Style::default().fg(COLOR_ACCENT)),
        ]));
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Preview",
            Style::default()
                .fg(COLOR_TEXT_SECONDARY)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        )));
        lines.extend(self.renderer.render(&composer.buffer).lines);
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Enter send · Tab new line · Esc cancel",
            Style::default()
                .fg(COLOR_TEXT_SECONDARY)
                .add_modifier(Modifier::ITALIC),
        )));

        let popup = Paragraph::new(text_with_lines(lines))
            .block(popup_block(composer.title(), COLOR_ACCENT))
            .wrap(Wrap { trim: false });
        frame.render_widget(popup, popup_area);
    }

    fn draw_signed_out(&self, frame: &mut Frame<'_>, area: Rect) {
        let popup_area = centered_rect(60, 40, area);
        frame.render_widget(Clear, popup_area);
        let lines = vec![
            Line::from(Span::styled(
                "You are signed out.",
                Style::default()
                    .fg(COLOR_TEXT_PRIMARY)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from("Save a new access token and start again:"),
            Line::from(Span::styled(
                "  social-tui --token <TOKEN>",
                Style::default().fg(COLOR_ACCENT),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "q quit",
                Style::default()
                    .fg(COLOR_TEXT_SECONDARY)
                    .add_modifier(Modifier::ITALIC),
            )),
        ];
        let popup = Paragraph::new(text_with_lines(lines))
            .block(popup_block("Sign in", COLOR_ERROR))
            .wrap(Wrap { trim: false });
        frame.render_widget(popup, popup_area);
    }

    fn footer_text(&self) -> String {
        if self.signed_out {
            return "q quit".to_string();
        }
        if self.composer.is_some() {
            return "Markdown, $math$ and @mentions are supported".to_string();
        }
        if self.profile_popup.is_some() {
            return "Esc close".to_string();
        }

        let parts: &[&str] = match self.view {
            View::Friends => match self.friend_tab {
                FriendList::Friends => &["Tab lists", "j/k move", "Enter profile", "x remove", "Esc feed"],
                FriendList::Pending => &["Tab lists", "j/k move", "a accept", "x reject", "Esc feed"],
                FriendList::Suggestions => {
                    &["Tab lists", "j/k move", "s send request", "Enter profile", "Esc feed"]
                }
            },
            View::Feed => match self.focused_pane {
                Pane::Posts => &["j/k posts", "l comments", "r refresh", "f friends", "q quit"],
                Pane::Content => &["j/k scroll", "c comment", "h/l panes", "f friends", "q quit"],
                Pane::Comments => &[
                    "j/k move",
                    "c comment",
                    "r reply",
                    "e edit",
                    "d delete",
                    "m mention",
                    "q quit",
                ],
            },
        };
        parts.join(" · ")
    }
}

fn step(current: usize, delta: i32, last: usize) -> usize {
    if delta < 0 {
        current.saturating_sub(delta.unsigned_abs() as usize)
    } else {
        current.saturating_add(delta as usize).min(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MockCommentService, MockFeedService, MockFriendService, MockProfileService};
    use crate::session::Manager;
    use anyhow::anyhow;
    use ratatui::backend::TestBackend;

    fn options(session: Manager) -> Options {
        Options {
            status_message: String::new(),
            page_size: 10,
            feed_service: Arc::new(MockFeedService),
            comment_service: Arc::new(MockCommentService::default()),
            friend_service: Arc::new(MockFriendService::default()),
            profile_service: Arc::new(MockProfileService),
            session: Arc::new(session),
        }
    }

    fn signed_in() -> Options {
        options(Manager::new(Some("demo".into())))
    }

    fn settle<F>(model: &mut Model, done: F)
    where
        F: Fn(&Model) -> bool,
    {
        for _ in 0..400 {
            model.poll_async();
            if done(model) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("model did not settle");
    }

    fn render(model: &mut Model, width: u16, height: u16) -> String {
        let mut terminal = Terminal::new(TestBackend::new(width, height)).unwrap();
        terminal.draw(|frame| model.draw(frame)).unwrap();
        model.check_sentinels();
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    fn loaded(model: &Model) -> bool {
        model.me.is_some()
            && model
                .section
                .as_ref()
                .is_some_and(|section| !section.pager().is_loading() && !section.store().is_empty())
    }

    fn press(model: &mut Model, keys: &str) {
        for ch in keys.chars() {
            model.handle_key(KeyCode::Char(ch)).unwrap();
        }
    }

    #[test]
    fn fit_rows_keeps_selection_visible() {
        let heights = [3, 3, 3, 3, 3];
        assert_eq!(fit_rows(&heights, 0, 0, 7), 0..2);
        assert_eq!(fit_rows(&heights, 4, 0, 7), 3..5);
        assert_eq!(fit_rows(&heights, 1, 3, 7), 1..3);
        assert_eq!(fit_rows(&[], 0, 0, 10), 0..0);
        assert_eq!(fit_rows(&[20], 0, 0, 5), 0..1);
    }

    #[test]
    fn step_clamps_to_bounds() {
        assert_eq!(step(0, -1, 4), 0);
        assert_eq!(step(3, 5, 4), 4);
        assert_eq!(step(2, 1, 4), 3);
    }

    #[test]
    fn pad_lines_fills_to_width() {
        let mut lines = vec![Line::from("ab")];
        pad_lines_to_width(&mut lines, 5);
        assert_eq!(visual_height(&lines, 5), 1);
        assert_eq!(lines[0].spans.len(), 2);
        assert_eq!(lines[0].spans[1].content.as_ref(), "   ");
    }

    #[test]
    fn loads_feed_and_threads_for_first_post() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);

        assert_eq!(model.feed.get(0).map(|post| post.id.as_str()), Some("welcome"));
        let rows: Vec<(&str, bool)> = model
            .comment_rows
            .iter()
            .map(|row| (row.id.as_str(), row.reply))
            .collect();
        assert_eq!(
            rows,
            vec![("c1", false), ("c2", true), ("c3", true), ("c4", false)]
        );

        let screen = render(&mut model, 140, 50);
        assert!(screen.contains("Comments"));
        assert!(screen.contains("Ann Lee"));
    }

    #[test]
    fn signed_out_without_token() {
        let mut model = Model::new(options(Manager::default()));
        assert!(model.signed_out);
        assert!(!model.handle_key(KeyCode::Char('j')).unwrap());
        let screen = render(&mut model, 100, 30);
        assert!(screen.contains("signed out"));
        assert!(model.handle_key(KeyCode::Char('q')).unwrap());
    }

    #[test]
    fn unauthorized_feed_signs_out() {
        struct Rejecting;
        impl FeedService for Rejecting {
            fn load_feed(&self, _page: u32, _size: u32) -> Result<Page<Post>> {
                Err(anyhow::Error::new(api::ApiError::Unauthorized).context("fetch feed"))
            }
        }
        let mut opts = signed_in();
        opts.feed_service = Arc::new(Rejecting);
        let mut model = Model::new(opts);
        settle(&mut model, |model| model.signed_out);
        assert_eq!(model.status_message, "Session expired");
    }

    #[test]
    fn reply_lands_under_the_root() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);

        model.focused_pane = Pane::Comments;
        model.selected_comment = 1;
        press(&mut model, "r");
        assert_eq!(
            model.composer.as_ref().map(|c| c.buffer.as_str()),
            Some("@bob ")
        );
        press(&mut model, "agreed");
        model.handle_key(KeyCode::Enter).unwrap();
        settle(&mut model, |model| model.pending_actions == 0);

        let reply = model
            .comment_rows
            .iter()
            .find(|row| row.id.starts_with("new-"))
            .expect("reply row");
        assert!(reply.reply);
        let section = model.section.as_ref().unwrap();
        let comment = section.store().get(&reply.id).unwrap();
        assert_eq!(comment.root_key(), "c1");
        assert_eq!(comment.content, "@bob agreed");
        assert!(section.is_own(comment));
    }

    #[test]
    fn delete_needs_confirmation_and_ownership() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);
        model.focused_pane = Pane::Comments;

        press(&mut model, "d");
        assert!(model.pending_delete.is_none());
        assert_eq!(model.status_message, "You can only delete your own comments");

        press(&mut model, "c");
        press(&mut model, "mine");
        model.handle_key(KeyCode::Enter).unwrap();
        settle(&mut model, |model| model.pending_actions == 0);
        let id = model.comment_rows[model.selected_comment].id.clone();

        press(&mut model, "d");
        assert_eq!(model.pending_delete.as_deref(), Some(id.as_str()));
        press(&mut model, "d");
        settle(&mut model, |model| model.pending_actions == 0);
        assert!(model.comment_rows.iter().all(|row| row.id != id));
    }

    #[test]
    fn empty_composer_stays_open() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);
        press(&mut model, "c");
        model.handle_key(KeyCode::Char(' ')).unwrap();
        model.handle_key(KeyCode::Enter).unwrap();
        assert!(model.composer.is_some());
        assert_eq!(model.status_message, "Comment text is required");
        model.handle_key(KeyCode::Esc).unwrap();
        assert!(model.composer.is_none());
    }

    #[test]
    fn mention_opens_profile() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);
        model.focused_pane = Pane::Comments;
        press(&mut model, "m");
        settle(&mut model, |model| model.pending_mention.is_none());
        assert_eq!(
            model.profile_popup.as_ref().map(|p| p.id.as_str()),
            Some("u-bob")
        );
        model.handle_key(KeyCode::Esc).unwrap();
        assert!(model.profile_popup.is_none());
    }

    #[test]
    fn scrolling_to_the_last_comment_loads_more() {
        let comments = (0..25)
            .map(|i| Comment {
                id: format!("c{i}"),
                content: format!("comment {i}"),
                post_id: None,
                root_id: None,
                parent_id: None,
                user: None,
                parent_user: None,
                created_at: None,
            })
            .collect();
        let mut opts = signed_in();
        opts.comment_service = Arc::new(MockCommentService::with_comments("welcome", comments));
        let mut model = Model::new(opts);
        settle(&mut model, loaded);
        assert_eq!(model.comment_rows.len(), 10);

        render(&mut model, 200, 200);
        settle(&mut model, |model| model.comment_rows.len() == 20);
        render(&mut model, 200, 200);
        settle(&mut model, |model| model.comment_rows.len() == 25);

        let section = model.section.as_ref().unwrap();
        assert!(!section.pager().has_more());
    }

    #[test]
    fn stale_comment_pages_are_dropped() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);
        let stale_id = model.comment_section_id;

        model.focused_pane = Pane::Posts;
        press(&mut model, "j");
        assert_ne!(model.comment_section_id, stale_id);
        model.handle_async_response(AsyncResponse::Comments {
            section_id: stale_id,
            request: PageRequest {
                generation: 0,
                number: 0,
                server_page: 0,
                size: 10,
            },
            result: Err(anyhow!("late")),
        });
        let section = model.section.as_ref().unwrap();
        assert_eq!(section.post_id(), "post-1");
        assert!(section.pager().error().is_none());
    }

    #[test]
    fn friend_requests_can_be_accepted() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);

        press(&mut model, "f");
        settle(&mut model, |model| !model.friends.pager().is_loading());
        assert_eq!(model.friends.len(), 2);

        model.handle_key(KeyCode::Tab).unwrap();
        settle(&mut model, |model| !model.friends.pager().is_loading());
        assert_eq!(model.friend_tab, FriendList::Pending);
        assert_eq!(model.friends.get(0).map(|p| p.id.as_str()), Some("u-cam"));

        press(&mut model, "a");
        settle(&mut model, |model| model.pending_actions == 0);
        assert!(model.friends.is_empty());
        assert_eq!(model.status_message, "Now friends with Cam Ngo");

        model.handle_key(KeyCode::Tab).unwrap();
        model.handle_key(KeyCode::Tab).unwrap();
        settle(&mut model, |model| {
            model.friend_tab == FriendList::Friends && !model.friends.pager().is_loading()
        });
        assert_eq!(model.friends.len(), 3);
    }

    #[test]
    fn switching_friend_lists_starts_from_the_first_page() {
        let mut opts = signed_in();
        opts.page_size = 1;
        let mut model = Model::new(opts);
        settle(&mut model, loaded);

        press(&mut model, "f");
        settle(&mut model, |model| !model.friends.pager().is_loading());
        assert_eq!(model.friends.len(), 1);
        assert!(model.friends.pager().has_more());

        render(&mut model, 140, 50);
        settle(&mut model, |model| model.friends.len() == 2);
        settle(&mut model, |model| !model.friends.pager().is_loading());
        assert_eq!(model.friends.pager().cursor().number, 1);
        let old_friend = model.friends.get(1).cloned().unwrap();

        model.handle_key(KeyCode::Tab).unwrap();
        assert_eq!(model.friend_tab, FriendList::Pending);
        assert_eq!(model.friends.pager().cursor().number, 0);
        assert!(model.friends.is_empty());
        settle(&mut model, |model| !model.friends.pager().is_loading());
        let ids: Vec<&str> = model.friends.items().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["u-cam"]);

        model.handle_async_response(AsyncResponse::Friends {
            list: FriendList::Friends,
            request: PageRequest {
                generation: 0,
                number: 1,
                server_page: 1,
                size: 1,
            },
            result: Ok(Page {
                content: vec![old_friend],
                number: 1,
                size: 1,
                total_elements: 2,
                total_pages: 2,
            }),
        });
        let ids: Vec<&str> = model.friends.items().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["u-cam"]);
        assert_eq!(model.friends.pager().cursor().number, 0);
    }

    #[test]
    fn removing_a_friend_asks_twice() {
        let mut model = Model::new(signed_in());
        settle(&mut model, loaded);
        press(&mut model, "f");
        settle(&mut model, |model| !model.friends.pager().is_loading());

        press(&mut model, "x");
        assert_eq!(model.pending_remove.as_deref(), Some("u-ann"));
        press(&mut model, "j");
        assert!(model.pending_remove.is_none());
        press(&mut model, "xx");
        settle(&mut model, |model| model.pending_actions == 0);
        assert_eq!(model.friends.len(), 1);
        assert_eq!(model.friends.get(0).map(|p| p.id.as_str()), Some("u-ann"));
    }
}
