//! Post and comment bodies: markdown with `$math$` and `@mentions`.
//!
//! Source text goes through pulldown-cmark into a small [`Document`] tree,
//! then [`Renderer`] turns that tree into ratatui text. Math spans are cut
//! out before the second markdown pass so code spans and fenced blocks keep
//! their dollars, and so markdown never sees TeX.

use std::ops::Range;

use once_cell::sync::Lazy;
use pulldown_cmark::{CodeBlockKind, CowStr, Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use ratatui::layout::Alignment;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use regex::Regex;

use crate::math::{MathNode, Typesetter, UnicodeTypesetter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextStyle {
    pub strong: bool,
    pub emphasis: bool,
    pub strikethrough: bool,
    pub link: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inline {
    Text { text: String, style: TextStyle },
    Code(String),
    Math(MathNode),
    Mention(String),
    LineBreak,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Paragraph(Vec<Inline>),
    Heading {
        level: u8,
        inlines: Vec<Inline>,
    },
    /// `marker` is absent on continuation paragraphs of the same item.
    ListItem {
        depth: usize,
        marker: Option<String>,
        inlines: Vec<Inline>,
    },
    Quote {
        depth: usize,
        inlines: Vec<Inline>,
    },
    CodeBlock {
        language: Option<String>,
        code: String,
    },
    Math(MathNode),
    Rule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub blocks: Vec<Block>,
}

impl Document {
    /// Usernames mentioned anywhere in the document, in order of appearance.
    pub fn mentions(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .flat_map(|block| match block {
                Block::Paragraph(inlines)
                | Block::Heading { inlines, .. }
                | Block::ListItem { inlines, .. }
                | Block::Quote { inlines, .. } => inlines.as_slice(),
                _ => &[][..],
            })
            .filter_map(|inline| match inline {
                Inline::Mention(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Splits a run of plain text into richer inline nodes.
///
/// Handlers only ever see text outside code; they return `None` to leave
/// the run untouched.
pub trait InlineHandler: Send + Sync {
    fn split(&self, text: &str, style: TextStyle) -> Option<Vec<Inline>>;
}

const MATH_OPEN: char = '\u{E000}';
const MATH_CLOSE: char = '\u{E001}';

static MATH_SLOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("\u{E000}([0-9]+)\u{E001}").expect("valid math slot regex"));

static MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@(\w+)").expect("valid mention regex"));

/// Math spans found in one source text.
///
/// `$$...$$` may span lines, `$...$` may not; both must be non-empty and
/// `\$` is never a delimiter. Each span is replaced by a slot marker that
/// markdown leaves alone and [`InlineHandler::split`] later expands.
pub struct MathHandler {
    nodes: Vec<MathNode>,
}

impl MathHandler {
    pub fn extract(source: &str, verbatim: &[Range<usize>]) -> (String, Self) {
        let bytes = source.as_bytes();
        let mut out = String::with_capacity(source.len());
        let mut nodes = Vec::new();
        let mut copied = 0;
        let mut i = 0;
        let mut next = 0;

        while i < bytes.len() {
            while verbatim.get(next).is_some_and(|range| range.end <= i) {
                next += 1;
            }
            // A span may not run into the next verbatim range.
            let limit = match verbatim.get(next) {
                Some(range) if range.start <= i => {
                    i = range.end;
                    continue;
                }
                Some(range) => range.start,
                None => bytes.len(),
            };
            match bytes[i] {
                b'\\' if bytes.get(i + 1) == Some(&b'$') => i += 2,
                b'$' => {
                    let display = bytes.get(i + 1) == Some(&b'$');
                    let width = if display { 2 } else { 1 };
                    let start = i + width;
                    match find_close(bytes, start, limit, display) {
                        Some(end) if !source[start..end].trim().is_empty() => {
                            out.push_str(&source[copied..i]);
                            out.push(MATH_OPEN);
                            out.push_str(&nodes.len().to_string());
                            out.push(MATH_CLOSE);
                            nodes.push(MathNode {
                                source: source[start..end].to_string(),
                                display,
                            });
                            i = end + width;
                            copied = i;
                        }
                        _ => i += width,
                    }
                }
                _ => i += 1,
            }
        }
        out.push_str(&source[copied..]);
        (out, Self { nodes })
    }
}

/// Closing delimiter at or after `start` and before `limit`.
fn find_close(bytes: &[u8], start: usize, limit: usize, display: bool) -> Option<usize> {
    let mut j = start;
    while j < limit {
        match bytes[j] {
            b'\\' => j += 2,
            b'\n' if !display => return None,
            b'$' if !display => return Some(j),
            b'$' if j + 1 < limit && bytes[j + 1] == b'$' => return Some(j),
            _ => j += 1,
        }
    }
    None
}

impl InlineHandler for MathHandler {
    fn split(&self, text: &str, style: TextStyle) -> Option<Vec<Inline>> {
        split_matches(&MATH_SLOT_RE, text, style, |caps| {
            let index: usize = caps[1].parse().ok()?;
            self.nodes.get(index).cloned().map(Inline::Math)
        })
    }
}

/// `@username` where the `@` does not follow a word character.
#[derive(Debug, Default, Clone, Copy)]
pub struct MentionHandler;

impl InlineHandler for MentionHandler {
    fn split(&self, text: &str, style: TextStyle) -> Option<Vec<Inline>> {
        split_matches(&MENTION_RE, text, style, |caps| {
            let start = caps.get(0)?.start();
            let preceded_by_word = text[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
            if preceded_by_word {
                None
            } else {
                Some(Inline::Mention(caps[1].to_string()))
            }
        })
    }
}

/// Cuts `text` at every match `make` accepts; declined matches stay text.
fn split_matches<F>(re: &Regex, text: &str, style: TextStyle, mut make: F) -> Option<Vec<Inline>>
where
    F: FnMut(&regex::Captures<'_>) -> Option<Inline>,
{
    let mut parts = Vec::new();
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let Some(node) = make(&caps) else { continue };
        if whole.start() > last {
            parts.push(Inline::Text {
                text: text[last..whole.start()].to_string(),
                style,
            });
        }
        parts.push(node);
        last = whole.end();
    }
    if parts.is_empty() {
        return None;
    }
    if last < text.len() {
        parts.push(Inline::Text {
            text: text[last..].to_string(),
            style,
        });
    }
    Some(parts)
}

fn markdown_options() -> Options {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_STRIKETHROUGH);
    opts.insert(Options::ENABLE_TABLES);
    opts.insert(Options::ENABLE_TASKLISTS);
    opts.insert(Options::ENABLE_FOOTNOTES);
    opts
}

/// Byte ranges markdown treats as literal: code spans, code blocks, HTML.
/// Sorted and non-overlapping.
fn verbatim_ranges(source: &str) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = Parser::new_ext(source, markdown_options())
        .into_offset_iter()
        .filter_map(|(event, range)| match event {
            Event::Code(_) | Event::Html(_) | Event::InlineHtml(_) => Some(range),
            Event::Start(Tag::CodeBlock(_)) => Some(range),
            _ => None,
        })
        .collect();
    ranges.sort_by_key(|range| range.start);

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

pub struct Renderer {
    typesetter: Box<dyn Typesetter>,
    extra_handlers: Vec<Box<dyn InlineHandler>>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self::with_typesetter(Box::new(UnicodeTypesetter))
    }

    pub fn with_typesetter(typesetter: Box<dyn Typesetter>) -> Self {
        Self {
            typesetter,
            extra_handlers: Vec::new(),
        }
    }

    /// Runs after the built-in math and mention handlers.
    pub fn with_handler(mut self, handler: Box<dyn InlineHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    pub fn parse(&self, input: &str) -> Document {
        let verbatim = verbatim_ranges(input);
        let (protected, math) = MathHandler::extract(input, &verbatim);

        let mut handlers: Vec<&dyn InlineHandler> = vec![&math, &MentionHandler];
        handlers.extend(self.extra_handlers.iter().map(|handler| handler.as_ref()));

        let mut builder = DocumentBuilder::new(&handlers);
        builder.run(Parser::new_ext(&protected, markdown_options()));
        builder.finish()
    }

    pub fn render(&self, input: &str) -> Text<'static> {
        self.render_document(&self.parse(input))
    }

    pub fn render_document(&self, document: &Document) -> Text<'static> {
        let mut lines: Vec<Line<'static>> = Vec::new();
        let mut previous: Option<&Block> = None;

        for block in &document.blocks {
            let tight = matches!(
                (previous, block),
                (Some(Block::ListItem { .. }), Block::ListItem { .. })
            );
            if previous.is_some() && !tight {
                lines.push(Line::default());
            }
            self.render_block(block, &mut lines);
            previous = Some(block);
        }

        if lines.is_empty() {
            lines.push(Line::from(Span::raw("")));
        }

        Text {
            lines,
            alignment: Some(Alignment::Left),
            style: Style::default(),
        }
    }

    fn render_block(&self, block: &Block, lines: &mut Vec<Line<'static>>) {
        match block {
            Block::Paragraph(inlines) => {
                lines.extend(self.inline_lines(inlines, Style::default(), Vec::new()));
            }
            Block::Heading { level, inlines } => {
                lines.extend(self.inline_lines(inlines, heading_style(*level), Vec::new()));
            }
            Block::ListItem {
                depth,
                marker,
                inlines,
            } => {
                let marker_text = match marker {
                    Some(marker) => format!("{marker} "),
                    None => " ".repeat(2),
                };
                let prefix = vec![
                    Span::raw("  ".repeat(*depth)),
                    Span::styled(marker_text, Style::default().fg(Color::Yellow)),
                ];
                lines.extend(self.inline_lines(inlines, Style::default(), prefix));
            }
            Block::Quote { depth, inlines } => {
                let quote = Style::default().fg(Color::Green);
                let prefix = vec![Span::styled(format!("{} ", ">".repeat((*depth).max(1))), quote)];
                lines.extend(self.inline_lines(inlines, quote, prefix));
            }
            Block::CodeBlock { language, code } => {
                let fence = match language {
                    Some(lang) => format!("```{lang}"),
                    None => "```".to_string(),
                };
                lines.push(Line::from(Span::raw(fence)));
                for line in code.trim_end_matches('\n').split('\n') {
                    lines.push(Line::from(Span::styled(
                        line.to_string(),
                        Style::default().fg(Color::Cyan),
                    )));
                }
                lines.push(Line::from(Span::raw("```")));
            }
            Block::Math(node) => {
                let line = match self.typesetter.typeset(node) {
                    Ok(text) => Line::from(vec![
                        Span::raw("    "),
                        Span::styled(text, math_style()),
                    ]),
                    Err(err) => {
                        tracing::debug!(error = %err, "math left as source");
                        Line::from(Span::raw(node.delimited()))
                    }
                };
                lines.push(line);
            }
            Block::Rule => lines.push(Line::from(Span::raw("―".repeat(20)))),
        }
    }

    /// Inline nodes as lines, split at hard breaks. Every line after the
    /// first gets `prefix` again, blanked out, so wrapped items stay aligned.
    fn inline_lines(
        &self,
        inlines: &[Inline],
        base: Style,
        prefix: Vec<Span<'static>>,
    ) -> Vec<Line<'static>> {
        let indent: String = prefix
            .iter()
            .map(|span| " ".repeat(span.content.chars().count()))
            .collect();
        let mut lines = Vec::new();
        let mut spans = prefix;

        for inline in inlines {
            match inline {
                Inline::Text { text, style } => {
                    spans.push(Span::styled(text.clone(), text_style(base, *style)));
                }
                Inline::Code(code) => {
                    spans.push(Span::styled(
                        format!("`{code}`"),
                        base.fg(Color::Cyan),
                    ));
                }
                Inline::Math(node) => match self.typesetter.typeset(node) {
                    Ok(text) => spans.push(Span::styled(text, base.patch(math_style()))),
                    Err(err) => {
                        tracing::debug!(error = %err, "math left as source");
                        spans.push(Span::styled(node.delimited(), base));
                    }
                },
                Inline::Mention(name) => {
                    spans.push(Span::styled(
                        format!("@{name}"),
                        base.fg(Color::LightBlue).add_modifier(Modifier::BOLD),
                    ));
                }
                Inline::LineBreak => {
                    lines.push(Line::from(std::mem::take(&mut spans)));
                    spans.push(Span::raw(indent.clone()));
                }
            }
        }
        lines.push(Line::from(spans));
        lines
    }
}

fn text_style(base: Style, style: TextStyle) -> Style {
    let mut out = base;
    if style.strong {
        out = out.add_modifier(Modifier::BOLD);
    }
    if style.emphasis {
        out = out.add_modifier(Modifier::ITALIC);
    }
    if style.strikethrough {
        out = out.add_modifier(Modifier::CROSSED_OUT);
    }
    if style.link {
        out = out.fg(Color::Blue).add_modifier(Modifier::UNDERLINED);
    }
    out
}

fn math_style() -> Style {
    Style::default().fg(Color::LightMagenta)
}

fn heading_style(level: u8) -> Style {
    match level {
        1 => Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        2 => Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
        3 => Style::default()
            .fg(Color::Magenta)
            .add_modifier(Modifier::BOLD),
        _ => Style::default().fg(Color::Magenta),
    }
}

fn level_to_u8(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

#[derive(Clone, Copy)]
struct ListState {
    ordered: bool,
    index: u64,
}

struct ItemMeta {
    depth: usize,
    marker: Option<String>,
}

#[derive(Default)]
struct CodeMeta {
    language: Option<String>,
    buffer: String,
}

struct DocumentBuilder<'h> {
    handlers: &'h [&'h dyn InlineHandler],
    blocks: Vec<Block>,
    inlines: Vec<Inline>,
    pending: String,
    strong: usize,
    emphasis: usize,
    strikethrough: usize,
    links: Vec<(usize, String)>,
    list_stack: Vec<ListState>,
    current_item: Option<ItemMeta>,
    quote_depth: usize,
    heading_level: Option<u8>,
    code_block: Option<CodeMeta>,
}

impl<'h> DocumentBuilder<'h> {
    fn new(handlers: &'h [&'h dyn InlineHandler]) -> Self {
        Self {
            handlers,
            blocks: Vec::new(),
            inlines: Vec::new(),
            pending: String::new(),
            strong: 0,
            emphasis: 0,
            strikethrough: 0,
            links: Vec::new(),
            list_stack: Vec::new(),
            current_item: None,
            quote_depth: 0,
            heading_level: None,
            code_block: None,
        }
    }

    fn run<'a, I>(&mut self, parser: I)
    where
        I: Iterator<Item = Event<'a>>,
    {
        for event in parser {
            match event {
                Event::Text(text) => self.text(text),
                Event::SoftBreak => self.append_text(" "),
                event => {
                    self.flush_text();
                    match event {
                        Event::Start(tag) => self.start_tag(tag),
                        Event::End(tag) => self.end_tag(tag),
                        Event::Code(code) => self.inlines.push(Inline::Code(code.into_string())),
                        Event::Html(_) | Event::InlineHtml(_) => {}
                        Event::FootnoteReference(name) => self.append_text(&format!("[{name}]")),
                        Event::HardBreak => self.inlines.push(Inline::LineBreak),
                        Event::Rule => {
                            self.flush_block();
                            self.blocks.push(Block::Rule);
                        }
                        Event::TaskListMarker(done) => {
                            self.append_text(if done { "[x] " } else { "[ ] " })
                        }
                        Event::Text(_) | Event::SoftBreak => {}
                    }
                }
            }
        }
        self.flush_text();
        self.flush_block();
    }

    fn finish(self) -> Document {
        Document {
            blocks: self.blocks,
        }
    }

    fn style(&self) -> TextStyle {
        TextStyle {
            strong: self.strong > 0,
            emphasis: self.emphasis > 0,
            strikethrough: self.strikethrough > 0,
            link: !self.links.is_empty(),
        }
    }

    fn start_tag(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => self.flush_block(),
            Tag::Heading { level, .. } => {
                self.flush_block();
                self.heading_level = Some(level_to_u8(level));
            }
            Tag::BlockQuote => {
                self.flush_block();
                self.quote_depth += 1;
            }
            Tag::CodeBlock(kind) => {
                self.flush_block();
                let language = match kind {
                    CodeBlockKind::Fenced(lang) if !lang.is_empty() => Some(lang.into_string()),
                    _ => None,
                };
                self.code_block = Some(CodeMeta {
                    language,
                    buffer: String::new(),
                });
            }
            Tag::List(start) => {
                self.flush_block();
                self.list_stack.push(ListState {
                    ordered: start.is_some(),
                    index: start.unwrap_or(1),
                });
            }
            Tag::Item => {
                self.flush_block();
                let depth = self.list_stack.len().saturating_sub(1);
                if let Some(state) = self.list_stack.last() {
                    let marker = if state.ordered {
                        format!("{}.", state.index)
                    } else {
                        "•".to_string()
                    };
                    self.current_item = Some(ItemMeta {
                        depth,
                        marker: Some(marker),
                    });
                }
            }
            Tag::Emphasis => self.emphasis += 1,
            Tag::Strong => self.strong += 1,
            Tag::Strikethrough => self.strikethrough += 1,
            Tag::Link { dest_url, .. } => {
                self.links.push((self.inlines.len(), dest_url.into_string()));
            }
            Tag::Image { .. } => self.append_text("[image]"),
            Tag::Table(_) | Tag::TableHead | Tag::TableRow | Tag::TableCell => {
                self.append_text("| ");
            }
            Tag::FootnoteDefinition(_) | Tag::HtmlBlock | Tag::MetadataBlock(_) => {}
        }
    }

    fn end_tag(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => self.flush_block(),
            TagEnd::Heading(_) => {
                self.flush_block();
                self.heading_level = None;
            }
            TagEnd::BlockQuote => {
                self.flush_block();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            TagEnd::CodeBlock => {
                if let Some(meta) = self.code_block.take() {
                    self.blocks.push(Block::CodeBlock {
                        language: meta.language,
                        code: meta.buffer,
                    });
                }
            }
            TagEnd::List(_) => {
                self.flush_block();
                self.list_stack.pop();
            }
            TagEnd::Item => {
                self.flush_block();
                if let Some(state) = self.list_stack.last_mut() {
                    state.index += 1;
                }
                self.current_item = None;
            }
            TagEnd::Emphasis => self.emphasis = self.emphasis.saturating_sub(1),
            TagEnd::Strong => self.strong = self.strong.saturating_sub(1),
            TagEnd::Strikethrough => self.strikethrough = self.strikethrough.saturating_sub(1),
            TagEnd::Link => {
                if let Some((start, target)) = self.links.pop() {
                    let label: String = self.inlines[start.min(self.inlines.len())..]
                        .iter()
                        .filter_map(|inline| match inline {
                            Inline::Text { text, .. } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect();
                    if !target.is_empty() && label.trim() != target {
                        self.append_text(&format!(" <{target}>"));
                        self.flush_text();
                    }
                }
            }
            TagEnd::TableHead | TagEnd::TableRow => self.inlines.push(Inline::LineBreak),
            TagEnd::Table => self.flush_block(),
            _ => {}
        }
    }

    fn text(&mut self, text: CowStr<'_>) {
        if let Some(code) = self.code_block.as_mut() {
            code.buffer.push_str(&text);
        } else {
            self.append_text(&text);
        }
    }

    fn append_text(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Hands the buffered text run to the inline handlers.
    fn flush_text(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending);
        let style = self.style();
        let mut nodes = vec![Inline::Text { text, style }];
        for handler in self.handlers {
            nodes = nodes
                .into_iter()
                .flat_map(|node| match node {
                    Inline::Text { text, style } => handler
                        .split(&text, style)
                        .unwrap_or_else(|| vec![Inline::Text { text, style }]),
                    other => vec![other],
                })
                .collect();
        }
        self.inlines.extend(nodes);
    }

    fn flush_block(&mut self) {
        self.flush_text();
        let inlines = trim_inlines(std::mem::take(&mut self.inlines));
        if inlines.is_empty() {
            return;
        }

        if let Some(level) = self.heading_level {
            self.blocks.push(Block::Heading { level, inlines });
            return;
        }

        if let Some(item) = self.current_item.as_mut() {
            self.blocks.push(Block::ListItem {
                depth: item.depth,
                marker: item.marker.take(),
                inlines,
            });
            return;
        }

        if self.quote_depth > 0 {
            self.blocks.push(Block::Quote {
                depth: self.quote_depth,
                inlines,
            });
            return;
        }

        if let [Inline::Math(node)] = inlines.as_slice() {
            if node.display {
                self.blocks.push(Block::Math(node.clone()));
                return;
            }
        }

        self.blocks.push(Block::Paragraph(inlines));
    }
}

/// Drops leading and trailing whitespace-only text and line breaks.
fn trim_inlines(mut inlines: Vec<Inline>) -> Vec<Inline> {
    let blank = |inline: &Inline| match inline {
        Inline::Text { text, .. } => text.trim().is_empty(),
        Inline::LineBreak => true,
        _ => false,
    };
    while inlines.last().is_some_and(blank) {
        inlines.pop();
    }
    let leading = inlines.iter().take_while(|inline| blank(*inline)).count();
    inlines.drain(..leading);

    if let Some(Inline::Text { text, .. }) = inlines.first_mut() {
        *text = text.trim_start().to_string();
    }
    if let Some(Inline::Text { text, .. }) = inlines.last_mut() {
        *text = text.trim_end().to_string();
    }
    inlines
}
