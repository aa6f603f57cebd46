// src/normalize.rs
//
// Pure Telegram-page → RSS-document normalization. Everything here is a
// function of the page content only: no clocks, no I/O, fixed output layout.
// Two fetches of unchanged upstream content must render byte-identical
// documents, so the change detector can compare snapshots structurally.
use anyhow::{anyhow, Result};
use chrono::DateTime;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};

use crate::config::FeedSource;

const TITLE_LENGTH: usize = 80;

macro_rules! sel {
    ($name:ident, $css:expr) => {
        static $name: Lazy<Selector> = Lazy::new(|| Selector::parse($css).unwrap());
    };
}

sel!(SEL_OG_TITLE, r#"meta[property="og:title"]"#);
sel!(SEL_OG_DESCRIPTION, r#"meta[property="og:description"]"#);
sel!(SEL_MESSAGE, "div.tgme_widget_message_wrap");
sel!(SEL_TEXT, "div.js-message_text");
sel!(SEL_BOLD, "b");
sel!(SEL_PHOTO, "a.tgme_widget_message_photo_wrap");
sel!(SEL_REPLY, "a.tgme_widget_message_reply");
sel!(SEL_REPLY_AUTHOR, "span.tgme_widget_message_author_name");
sel!(SEL_REPLY_TEXT, "div.js-message_reply_text");
sel!(SEL_VIDEO, "div.tgme_widget_message_video_wrap");
sel!(SEL_PREVIEW, "a.tgme_widget_message_link_preview");
sel!(SEL_PREVIEW_SITE, "div.link_preview_site_name");
sel!(SEL_PREVIEW_IMAGE, "i.link_preview_image");
sel!(SEL_PREVIEW_TITLE, "div.link_preview_title");
sel!(SEL_PREVIEW_DESCRIPTION, "div.link_preview_description");
sel!(SEL_TIME, "time.time");
sel!(SEL_DATE_LINK, "a.tgme_widget_message_date");
sel!(SEL_FROM_AUTHOR, "span.tgme_widget_message_from_author");
sel!(SEL_OWNER_NAME, "a.tgme_widget_message_owner_name");

#[derive(Debug, Clone, PartialEq, Eq)]
struct FeedItem {
    title: String,
    description: String,
    /// Raw `datetime` attribute from the page (ISO 8601), kept verbatim.
    pub_date: String,
    link: String,
    author: String,
}

#[derive(Debug, Clone)]
struct ChannelPage {
    title: String,
    description: String,
    link: String,
    items: Vec<FeedItem>,
}

/// Canonical RSS document for one source's fetched page.
pub fn render_channel(source: &FeedSource, html: &str) -> Result<String> {
    let page = parse_channel(source, html)?;
    Ok(render_rss(&page))
}

fn parse_channel(source: &FeedSource, html: &str) -> Result<ChannelPage> {
    let doc = Html::parse_document(html);

    let title = meta_content(&doc, &SEL_OG_TITLE)
        .ok_or_else(|| anyhow!("{}: channel page missing og:title", source.id))?;
    let description = meta_content(&doc, &SEL_OG_DESCRIPTION)
        .ok_or_else(|| anyhow!("{}: channel page missing og:description", source.id))?;

    let mut items = Vec::new();
    for message in doc.select(&SEL_MESSAGE) {
        match parse_message(message) {
            Some(item) => items.push(item),
            None => {
                tracing::warn!(source = %source.id, "skipping message without date/link");
            }
        }
    }

    Ok(ChannelPage {
        title,
        description,
        // Readers get the public channel URL, not the widget one.
        link: source.endpoint().replace("t.me/s/", "t.me/"),
        items,
    })
}

fn meta_content(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(str::to_string)
}

/// One message widget → one feed item. Messages without a timestamp or a
/// permalink are structurally broken and get skipped by the caller.
fn parse_message(message: ElementRef<'_>) -> Option<FeedItem> {
    let pub_date = message
        .select(&SEL_TIME)
        .next()
        .and_then(|el| el.value().attr("datetime"))?
        .to_string();
    let link = message
        .select(&SEL_DATE_LINK)
        .next()
        .and_then(|el| el.value().attr("href"))?
        .to_string();

    let text = message.select(&SEL_TEXT).next();

    let mut description = text
        .map(|el| {
            // Some layouts nest the real text one level deeper.
            el.select(&SEL_TEXT)
                .next()
                .map(|inner| inner.inner_html())
                .unwrap_or_else(|| el.inner_html())
        })
        .unwrap_or_default();

    let title = match text.and_then(|el| el.select(&SEL_BOLD).next()) {
        Some(b) => {
            let t = truncate_chars(&collapse_ws(&b.text().collect::<String>()), TITLE_LENGTH);
            format!("{t}...")
        }
        None => "...".to_string(),
    };

    for photo in message.select(&SEL_PHOTO) {
        if let Some(img) = photo.value().attr("style").and_then(image_from_style) {
            description = format!("{description}\n{img}");
        }
    }

    if let Some(reply) = message.select(&SEL_REPLY).next() {
        if let Some(quote) = render_reply(reply) {
            description = format!("{quote}\n{description}");
        }
    }

    if message.select(&SEL_VIDEO).next().is_some() {
        description = format!(
            "{description}\n<p><b>This message contains a video; visit the channel to watch it.</b></p>"
        );
    }

    if let Some(preview) = message.select(&SEL_PREVIEW).next() {
        if let Some(block) = render_preview(preview) {
            description = format!("{description}\n{block}");
        }
    }

    let author = message
        .select(&SEL_FROM_AUTHOR)
        .next()
        .or_else(|| message.select(&SEL_OWNER_NAME).next())
        .map(|el| collapse_ws(&el.text().collect::<String>()))
        .unwrap_or_default();

    Some(FeedItem {
        title,
        description,
        pub_date,
        link,
        author,
    })
}

/// Quoted reply rendered as the blockquote convention RSS readers recognize.
fn render_reply(reply: ElementRef<'_>) -> Option<String> {
    let href = reply.value().attr("href")?;
    let author = reply.select(&SEL_REPLY_AUTHOR).next()?.inner_html();
    let text = reply.select(&SEL_REPLY_TEXT).next()?.inner_html();
    Some(format!(
        "<div class=\"rsshub-quote\"><blockquote><p><a href=\"{href}\"><b>{author}</b>:</a></p><p>{text}</p></blockquote></div>"
    ))
}

fn render_preview(preview: ElementRef<'_>) -> Option<String> {
    let href = preview.value().attr("href")?;
    let site_name = preview.select(&SEL_PREVIEW_SITE).next()?.inner_html();

    let image = preview
        .select(&SEL_PREVIEW_IMAGE)
        .next()
        .and_then(|el| el.value().attr("style"))
        .and_then(image_from_style)
        .unwrap_or_default();

    let title = preview
        .select(&SEL_PREVIEW_TITLE)
        .next()
        .map(|el| el.inner_html())
        .unwrap_or_else(|| site_name.clone());

    let description = preview
        .select(&SEL_PREVIEW_DESCRIPTION)
        .next()
        .map(|el| format!("<p>{}</p>", el.inner_html()))
        .unwrap_or_default();

    Some(format!(
        "<blockquote><b>{site_name}</b><br><b><a href=\"{href}\">{title}</a></b><br>{description}{image}</blockquote>"
    ))
}

/// Telegram serves photos as CSS backgrounds; pull the URL out of the
/// inline style and emit a plain img tag.
fn image_from_style(style: &str) -> Option<String> {
    static RE_URL: Lazy<regex::Regex> =
        Lazy::new(|| regex::Regex::new(r"url\('(.*?)'\)").unwrap());
    let url = RE_URL.captures(style)?.get(1)?.as_str();
    Some(format!(
        "<img src=\"{url}\" referrerpolicy=\"no-referrer\">"
    ))
}

fn collapse_ws(s: &str) -> String {
    static RE_WS: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"\s+").unwrap());
    RE_WS.replace_all(s, " ").trim().to_string()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}

/// lastBuildDate is derived from the newest item instead of the wall clock,
/// so rendering stays a pure function of content.
fn last_build_date(items: &[FeedItem]) -> Option<String> {
    items
        .iter()
        .filter_map(|it| DateTime::parse_from_rfc3339(&it.pub_date).ok())
        .max()
        .map(|dt| dt.to_rfc2822())
}

fn render_rss(page: &ChannelPage) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str("<rss version=\"2.0\">\n<channel>\n");
    push_text_element(&mut out, "title", &page.title);
    push_text_element(&mut out, "description", &page.description);
    push_text_element(&mut out, "link", &page.link);
    if let Some(lbd) = last_build_date(&page.items) {
        push_text_element(&mut out, "lastBuildDate", &lbd);
    }
    for item in &page.items {
        out.push_str("<item>\n");
        push_text_element(&mut out, "title", &item.title);
        out.push_str("<description><![CDATA[");
        out.push_str(&cdata_escape(&item.description));
        out.push_str("]]></description>\n");
        push_text_element(&mut out, "pubDate", &item.pub_date);
        push_text_element(&mut out, "link", &item.link);
        push_text_element(&mut out, "author", &item.author);
        out.push_str("</item>\n");
    }
    out.push_str("</channel>\n</rss>\n");
    out
}

fn push_text_element(out: &mut String, tag: &str, value: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(&html_escape::encode_text(value));
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
}

/// CDATA cannot contain "]]>"; split the terminator across two sections.
fn cdata_escape(s: &str) -> String {
    s.replace("]]>", "]]]]><![CDATA[>")
}
