use chrono::{DateTime, Utc};

use crate::model::{Profile, UserSnapshot};

/// "just now", "5m ago", "3h ago", "2d ago", then a plain date.
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(at);
    let secs = elapsed.num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }
    let minutes = elapsed.num_minutes();
    if minutes < 60 {
        return format!("{minutes}m ago");
    }
    let hours = elapsed.num_hours();
    if hours < 24 {
        return format!("{hours}h ago");
    }
    let days = elapsed.num_days();
    if days < 7 {
        return format!("{days}d ago");
    }
    at.format("%Y-%m-%d").to_string()
}

pub fn age_label(at: Option<DateTime<Utc>>) -> String {
    at.map(|at| relative_time(at, Utc::now()))
        .unwrap_or_default()
}

fn full_name(first: &str, last: &str, username: &str) -> String {
    let name = format!("{} {}", first.trim(), last.trim());
    let name = name.trim();
    if name.is_empty() {
        if username.is_empty() {
            "unknown".to_string()
        } else {
            username.to_string()
        }
    } else {
        name.to_string()
    }
}

pub fn display_name(user: Option<&UserSnapshot>) -> String {
    match user {
        Some(user) => full_name(&user.first_name, &user.last_name, &user.username),
        None => "unknown".to_string(),
    }
}

pub fn profile_name(profile: &Profile) -> String {
    full_name(&profile.first_name, &profile.last_name, &profile.username)
}

/// Up to two uppercase letters, used where an avatar would go.
pub fn initials(user: Option<&UserSnapshot>) -> String {
    let Some(user) = user else {
        return "?".to_string();
    };
    let letters: String = [&user.first_name, &user.last_name]
        .iter()
        .filter_map(|part| part.trim().chars().next())
        .flat_map(char::to_uppercase)
        .collect();
    if !letters.is_empty() {
        return letters;
    }
    user.username
        .chars()
        .next()
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_else(|| "?".to_string())
}
