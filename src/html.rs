/// HTML特殊文字をエスケープ
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// 共通レイアウト
pub fn page(title: &str, nav: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{}</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 0; background: #f9fafb; color: #111827; }}
nav {{ display: flex; justify-content: space-between; align-items: center; padding: 1rem; background: #fff; border-bottom: 1px solid #e5e7eb; }}
nav a {{ margin-right: 1.5rem; text-decoration: none; color: #374151; font-size: 0.875rem; }}
nav a.active {{ color: #1d4ed8; font-weight: 600; }}
main {{ max-width: 1280px; margin: 0 auto; padding: 2rem 1rem; }}
.cards {{ display: grid; grid-template-columns: repeat(4, 1fr); gap: 1rem; margin-bottom: 1.5rem; }}
.card {{ background: #fff; border-radius: 0.5rem; box-shadow: 0 1px 3px rgba(0,0,0,.1); padding: 1rem; }}
.card p {{ font-size: 1.875rem; font-weight: 700; margin: 0; }}
.alert {{ background: #fee2e2; color: #991b1b; padding: 0.75rem 1rem; border-radius: 0.375rem; margin-bottom: 1rem; }}
.denied {{ text-align: center; padding: 3rem 0; color: #dc2626; }}
table {{ width: 100%; border-collapse: collapse; background: #fff; }}
th {{ text-align: left; font-size: 0.75rem; text-transform: uppercase; color: #6b7280; padding: 0.75rem 1.5rem; background: #f9fafb; }}
td {{ padding: 1rem 1.5rem; font-size: 0.875rem; border-top: 1px solid #e5e7eb; }}
tr.odd {{ background: #f9fafb; }}
.status-present {{ color: #166534; }} .status-late {{ color: #854d0e; }} .status-absent {{ color: #991b1b; }}
</style>
</head>
<body>
{}
<main>
{}
</main>
</body>
</html>"#,
        escape(title),
        nav,
        body
    )
}
