//! Session cookie IO. Values too large for one cookie are split into
//! `<name>C1..<name>CN`, with `<name>` holding `chunks-N`.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

const CHUNK_SIZE: usize = 3800;
const MAX_CHUNKS: usize = 16;
const CHUNK_MARKER: &str = "chunks-";

fn chunk_name(name: &str, index: usize) -> String {
    format!("{name}C{index}")
}

fn chunk_count(jar: &CookieJar, name: &str) -> usize {
    jar.get(name)
        .and_then(|cookie| cookie.value().strip_prefix(CHUNK_MARKER)?.parse().ok())
        .unwrap_or(0)
}

fn build(name: String, value: String, max_age: time::Duration, secure: bool) -> Cookie<'static> {
    Cookie::build(name, value)
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .finish()
}

fn removal(name: String) -> Cookie<'static> {
    Cookie::build(name, "").path("/").finish()
}

pub fn read(jar: &CookieJar, name: &str) -> Option<String> {
    let value = jar.get(name)?.value();
    let Some(count) = value.strip_prefix(CHUNK_MARKER) else {
        return Some(value.to_string());
    };
    let count: usize = count.parse().ok()?;
    if count == 0 || count > MAX_CHUNKS {
        return None;
    }
    let mut joined = String::with_capacity(count * CHUNK_SIZE);
    for index in 1..=count {
        joined.push_str(jar.get(&chunk_name(name, index))?.value());
    }
    Some(joined)
}

pub fn write(
    jar: CookieJar,
    name: &str,
    value: &str,
    max_age: time::Duration,
    secure: bool,
) -> CookieJar {
    let previous = chunk_count(&jar, name);
    let chunks: Vec<String> = value
        .as_bytes()
        .chunks(CHUNK_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    let mut jar = if chunks.len() <= 1 {
        jar.add(build(name.to_string(), value.to_string(), max_age, secure))
    } else {
        let marker = format!("{CHUNK_MARKER}{}", chunks.len());
        let mut jar = jar.add(build(name.to_string(), marker, max_age, secure));
        for (index, chunk) in chunks.iter().enumerate() {
            jar = jar.add(build(chunk_name(name, index + 1), chunk.clone(), max_age, secure));
        }
        jar
    };

    let written = if chunks.len() <= 1 { 0 } else { chunks.len() };
    for index in (written + 1)..=previous {
        jar = jar.remove(removal(chunk_name(name, index)));
    }
    jar
}

pub fn clear(jar: CookieJar, name: &str) -> CookieJar {
    let previous = chunk_count(&jar, name);
    let mut jar = jar.remove(removal(name.to_string()));
    for index in 1..=previous {
        jar = jar.remove(removal(chunk_name(name, index)));
    }
    jar
}
