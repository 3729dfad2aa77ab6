//! Parsers for `hdiutil` output.

/// Locate the mount point printed by `hdiutil attach`.
///
/// `volumes_root` is the directory images mount under, normally `/Volumes`. Attach output
/// is a table of `<device> <content hint> <mount point>` rows, so the last row with at
/// least three fields whose tail starts with the root wins; the tail may contain spaces.
/// Without such a row the first raw occurrence of the root is taken instead.
pub fn parse_attach_mount_point(output: &str, volumes_root: &str) -> Option<String> {
    let prefix = format!("{}/", volumes_root.trim_end_matches('/'));
    let lines: Vec<&str> = output.split(['\n', '\r']).collect();

    let from_table = lines.iter().rev().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return None;
        }
        let path = fields[2..].join(" ");
        path.starts_with(&prefix).then_some(path)
    });

    from_table.or_else(|| {
        lines.iter().find_map(|line| {
            line.find(&prefix)
                .map(|start| line[start..].trim().to_string())
        })
    })
}

/// `hdiutil detach` sometimes exits nonzero after the volume is already gone.
pub fn is_detach_acknowledged(stdout: &str) -> bool {
    stdout.contains("ejected")
}
