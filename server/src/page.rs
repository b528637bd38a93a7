//! HTML pages. One template with an optional result section.

use axum::http::StatusCode;

const STYLE: &str = "body{font-family:sans-serif;max-width:720px;margin:2rem auto;padding:0 1rem}\
video{width:100%;margin-top:1rem}.notice{color:#a00}";

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n{body}\n</body>\n</html>\n"
    )
}

fn upload_form() -> &'static str {
    "<h1>Helmet detection</h1>\n\
     <form action=\"/upload\" method=\"post\" enctype=\"multipart/form-data\">\n\
     <input type=\"file\" name=\"video\" accept=\"video/*\">\n\
     <button type=\"submit\">Upload</button>\n\
     </form>"
}

/// `GET /`
pub fn index() -> String {
    layout("Helmet detection", upload_form())
}

/// `POST /upload` result. `output` is the stored output's file name, absent
/// when the upload could not be decoded.
pub fn result(output: Option<&str>) -> String {
    let section = match output {
        Some(name) => format!(
            "<h2>Processed video</h2>\n<video controls src=\"/uploads/{}\"></video>\n\
             <p><a href=\"/uploads/{}\" download>Download</a></p>",
            escape(name),
            escape(name)
        ),
        None => "<p class=\"notice\">The uploaded file could not be read as a video; \
                 no output was produced.</p>"
            .to_string(),
    };
    layout("Helmet detection", &format!("{}\n{section}", upload_form()))
}

pub fn error(status: StatusCode, message: &str) -> String {
    layout(
        "Error",
        &format!(
            "<h1>{status}</h1>\n<p class=\"notice\">{}</p>\n<p><a href=\"/\">Back</a></p>",
            escape(message)
        ),
    )
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
