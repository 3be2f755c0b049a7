//! LVM text-format metadata.
//!
//! `vgcfgbackup` dumps a volume group as a nested key/value text; we
//! parse it into an order-preserving tree, edit the tree, and serialize
//! it back for `vgcfgrestore`. Serialization is canonical (deterministic
//! layout, comments dropped), which is what makes the rotation
//! self-check meaningful: rotating forward then backward must reproduce
//! the canonical form byte for byte.

use anyhow::{Context, Result};

use crate::common::units::bytes_to_sectors;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(u64),
    Str(String),
    List(Vec<Value>),
    Section(Section),
}

/// Key/value pairs in file order. LVM accepts duplicate-free maps but
/// the order matters for readable diffs, so a vec it is.
pub type Section = Vec<(String, Value)>;

pub fn parse(text: &str) -> Result<Section> {
    let mut lines = text.lines().peekable();
    parse_section(&mut lines, 0)
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn parse_section<'a, I>(lines: &mut std::iter::Peekable<I>, depth: usize) -> Result<Section>
where
    I: Iterator<Item = &'a str>,
{
    let mut section = Section::new();

    while let Some(raw) = lines.next() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            anyhow::ensure!(depth > 0, "unbalanced `}}`");
            return Ok(section);
        }
        if let Some(name) = line.strip_suffix('{') {
            let inner = parse_section(lines, depth + 1)?;
            section.push((name.trim().to_string(), Value::Section(inner)));
            continue;
        }

        let (key, rhs) = line
            .split_once('=')
            .with_context(|| format!("expected `key = value`, got {line:?}"))?;
        let key = key.trim().to_string();
        let rhs = rhs.trim();

        if rhs.starts_with('[') && !rhs.ends_with(']') {
            // Multi-line list: gather until the closing bracket.
            let mut list_text = rhs.to_string();
            for raw in lines.by_ref() {
                let cont = strip_comment(raw).trim();
                list_text.push(' ');
                list_text.push_str(cont);
                if cont.ends_with(']') {
                    break;
                }
            }
            section.push((key, parse_value(&list_text)?));
        } else {
            section.push((key, parse_value(rhs)?));
        }
    }

    anyhow::ensure!(depth == 0, "unterminated section");
    Ok(section)
}

fn parse_value(text: &str) -> Result<Value> {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .context("unterminated list")?
            .trim();
        let mut items = Vec::new();
        if !inner.is_empty() {
            for item in split_list_items(inner) {
                items.push(parse_value(&item)?);
            }
        }
        return Ok(Value::List(items));
    }
    if let Some(inner) = text.strip_prefix('"') {
        let inner = inner.strip_suffix('"').context("unterminated string")?;
        return Ok(Value::Str(inner.to_string()));
    }
    text.parse()
        .map(Value::Int)
        .with_context(|| format!("expected an integer, got {text:?}"))
}

fn split_list_items(inner: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in inner.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                items.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

pub fn serialize(section: &Section) -> String {
    let mut out = String::new();
    serialize_section(section, 0, &mut out);
    out
}

fn serialize_section(section: &Section, depth: usize, out: &mut String) {
    let indent = "\t".repeat(depth);
    for (key, value) in section {
        match value {
            Value::Section(inner) => {
                out.push_str(&format!("{indent}{key} {{\n"));
                serialize_section(inner, depth + 1, out);
                out.push_str(&format!("{indent}}}\n"));
            }
            other => {
                out.push_str(&format!("{indent}{key} = {}\n", serialize_value(other)));
            }
        }
    }
}

fn serialize_value(value: &Value) -> String {
    match value {
        Value::Int(n) => n.to_string(),
        Value::Str(s) => format!("\"{s}\""),
        Value::List(items) => {
            let rendered: Vec<String> = items.iter().map(serialize_value).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Section(_) => unreachable!("sections are serialized separately"),
    }
}

fn get<'a>(section: &'a Section, key: &str) -> Option<&'a Value> {
    section.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn get_mut<'a>(section: &'a mut Section, key: &str) -> Option<&'a mut Value> {
    section.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn get_section_mut<'a>(section: &'a mut Section, key: &str) -> Result<&'a mut Section> {
    match get_mut(section, key) {
        Some(Value::Section(inner)) => Ok(inner),
        _ => anyhow::bail!("missing section {key:?}"),
    }
}

fn get_int(section: &Section, key: &str) -> Result<u64> {
    match get(section, key) {
        Some(Value::Int(n)) => Ok(*n),
        _ => anyhow::bail!("missing integer {key:?}"),
    }
}

fn get_str<'a>(section: &'a Section, key: &str) -> Result<&'a str> {
    match get(section, key) {
        Some(Value::Str(s)) => Ok(s),
        _ => anyhow::bail!("missing string {key:?}"),
    }
}

fn set_int(section: &mut Section, key: &str, value: u64) {
    match get_mut(section, key) {
        Some(slot) => *slot = Value::Int(value),
        None => section.push((key.to_string(), Value::Int(value))),
    }
}

/// One linear mapping of logical extents onto a PV.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    start_extent: u64,
    extent_count: u64,
    pv: String,
    pv_offset: u64,
}

fn read_segments(lv: &Section) -> Result<Vec<Segment>> {
    let segment_count = get_int(lv, "segment_count")?;
    let mut segments = Vec::with_capacity(segment_count as usize);

    for i in 1..=segment_count {
        let seg = match get(lv, &format!("segment{i}")) {
            Some(Value::Section(seg)) => seg,
            _ => anyhow::bail!("missing segment{i}"),
        };
        // Only plain linear segments can be permuted safely.
        anyhow::ensure!(
            get_str(seg, "type")? == "striped" && get_int(seg, "stripe_count")? == 1,
            "segment{i} is not linear"
        );
        let stripes = match get(seg, "stripes") {
            Some(Value::List(items)) => items,
            _ => anyhow::bail!("segment{i} has no stripes"),
        };
        anyhow::ensure!(stripes.len() == 2, "segment{i} stripes are not a single pair");
        let pv = match &stripes[0] {
            Value::Str(s) => s.clone(),
            _ => anyhow::bail!("segment{i} stripe PV is not a string"),
        };
        let pv_offset = match &stripes[1] {
            Value::Int(n) => *n,
            _ => anyhow::bail!("segment{i} stripe offset is not an integer"),
        };
        segments.push(Segment {
            start_extent: get_int(seg, "start_extent")?,
            extent_count: get_int(seg, "extent_count")?,
            pv,
            pv_offset,
        });
    }

    Ok(segments)
}

fn segment_section(seg: &Segment) -> Section {
    vec![
        ("start_extent".to_string(), Value::Int(seg.start_extent)),
        ("extent_count".to_string(), Value::Int(seg.extent_count)),
        ("type".to_string(), Value::Str("striped".to_string())),
        ("stripe_count".to_string(), Value::Int(1)),
        (
            "stripes".to_string(),
            Value::List(vec![
                Value::Str(seg.pv.clone()),
                Value::Int(seg.pv_offset),
            ]),
        ),
    ]
}

/// Coalesce neighbours that map contiguous logical extents onto
/// contiguous physical ones. Rotation leaves such seams behind, and
/// without this pass undoing a rotation would not reproduce the
/// original segmentation.
fn merge_adjacent(segments: &mut Vec<Segment>) {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments.drain(..) {
        if let Some(prev) = merged.last_mut() {
            if prev.pv == seg.pv
                && prev.start_extent + prev.extent_count == seg.start_extent
                && prev.pv_offset + prev.extent_count == seg.pv_offset
            {
                prev.extent_count += seg.extent_count;
                continue;
            }
        }
        merged.push(seg);
    }
    *segments = merged;
}

fn write_segments(lv: &mut Section, segments: &[Segment]) {
    // Drop segmentN entries; segment_count is updated in place so the
    // surrounding key order survives a rewrite.
    lv.retain(|(key, _)| {
        !(key.starts_with("segment") && key["segment".len()..].parse::<u64>().is_ok())
    });
    set_int(lv, "segment_count", segments.len() as u64);
    for (i, seg) in segments.iter().enumerate() {
        lv.push((
            format!("segment{}", i + 1),
            Value::Section(segment_section(seg)),
        ));
    }
}

/// Rotate an LV's extent mapping by one PE.
///
/// Forward moves the first logical extent's physical storage to the last
/// logical position; backward moves the last to the front. The edit only
/// touches segment entries and `segment_count`.
pub fn rotate(cfg: &mut Section, vgname: &str, lvname: &str, forward: bool, size: u64) -> Result<()> {
    let vg = get_section_mut(cfg, vgname)?;
    let pe_sectors = get_int(vg, "extent_size")?;
    let lvs = get_section_mut(vg, "logical_volumes")?;
    let lv = get_section_mut(lvs, lvname)?;

    let mut segments = read_segments(lv)?;
    let extent_total: u64 = segments.iter().map(|s| s.extent_count).sum();
    anyhow::ensure!(
        extent_total * pe_sectors == bytes_to_sectors(size),
        "segments cover {extent_total} extents, which does not match the LV size"
    );
    anyhow::ensure!(extent_total > 1, "cannot rotate a single-extent LV");

    if forward {
        let first = &mut segments[0];
        let moved_pv = first.pv.clone();
        let moved_offset = first.pv_offset;
        first.extent_count -= 1;
        first.pv_offset += 1;
        for seg in &mut segments[1..] {
            seg.start_extent -= 1;
        }
        segments.push(Segment {
            start_extent: extent_total - 1,
            extent_count: 1,
            pv: moved_pv,
            pv_offset: moved_offset,
        });
        if segments[0].extent_count == 0 {
            segments.remove(0);
        }
    } else {
        let last = segments.last_mut().expect("extent_total > 1");
        last.extent_count -= 1;
        let moved_pv = last.pv.clone();
        let moved_offset = last.pv_offset + last.extent_count;
        let last_emptied = last.extent_count == 0;
        for seg in &mut segments {
            seg.start_extent += 1;
        }
        if last_emptied {
            segments.pop();
        }
        segments.insert(
            0,
            Segment {
                start_extent: 0,
                extent_count: 1,
                pv: moved_pv,
                pv_offset: moved_offset,
            },
        );
    }

    merge_adjacent(&mut segments);
    write_segments(lv, &segments);
    Ok(())
}

/// The metadata for a freshly converted device: one PV covering it, one
/// LV whose two segments alias the original byte stream with the first
/// PE rotated to the end.
pub struct InitialVg<'a> {
    pub vgname: &'a str,
    pub vg_uuid: &'a str,
    pub pv_uuid: &'a str,
    pub lvname: &'a str,
    pub lv_uuid: &'a str,
    pub pe_sectors: u64,
    pub pe_count: u64,
    pub ba_start: u64,
    pub ba_size: u64,
}

pub fn initial_vg_config(vg: &InitialVg<'_>) -> Section {
    let status = |items: &[&str]| {
        Value::List(
            items
                .iter()
                .map(|s| Value::Str(s.to_string()))
                .collect(),
        )
    };

    let pv0: Section = vec![
        ("id".to_string(), Value::Str(vg.pv_uuid.to_string())),
        ("status".to_string(), status(&["ALLOCATABLE"])),
        ("pe_start".to_string(), Value::Int(vg.pe_sectors)),
        ("pe_count".to_string(), Value::Int(vg.pe_count)),
        ("ba_start".to_string(), Value::Int(vg.ba_start)),
        ("ba_size".to_string(), Value::Int(vg.ba_size)),
    ];

    let segments = [
        Segment {
            start_extent: 0,
            extent_count: 1,
            pv: "pv0".to_string(),
            pv_offset: vg.pe_count - 1,
        },
        Segment {
            start_extent: 1,
            extent_count: vg.pe_count - 1,
            pv: "pv0".to_string(),
            pv_offset: 0,
        },
    ];

    let mut lv: Section = vec![
        ("id".to_string(), Value::Str(vg.lv_uuid.to_string())),
        ("status".to_string(), status(&["READ", "WRITE", "VISIBLE"])),
        ("segment_count".to_string(), Value::Int(2)),
    ];
    write_segments(&mut lv, &segments);

    let vg_section: Section = vec![
        ("id".to_string(), Value::Str(vg.vg_uuid.to_string())),
        ("seqno".to_string(), Value::Int(0)),
        (
            "status".to_string(),
            status(&["RESIZEABLE", "READ", "WRITE"]),
        ),
        ("extent_size".to_string(), Value::Int(vg.pe_sectors)),
        ("max_lv".to_string(), Value::Int(0)),
        ("max_pv".to_string(), Value::Int(0)),
        (
            "physical_volumes".to_string(),
            Value::Section(vec![("pv0".to_string(), Value::Section(pv0))]),
        ),
        (
            "logical_volumes".to_string(),
            Value::Section(vec![(
                vg.lvname.to_string(),
                Value::Section(lv),
            )]),
        ),
    ];

    vec![
        (
            "contents".to_string(),
            Value::Str("Text Format Volume Group".to_string()),
        ),
        ("version".to_string(), Value::Int(1)),
        (vg.vgname.to_string(), Value::Section(vg_section)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const PE_SECTORS: u64 = 8192; // 4MiB

    fn sample_vg() -> InitialVg<'static> {
        InitialVg {
            vgname: "vg.loop0",
            vg_uuid: "11111111-1111-1111-1111-111111111111",
            pv_uuid: "22222222-2222-2222-2222-222222222222",
            lvname: "lv1",
            lv_uuid: "33333333-3333-3333-3333-333333333333",
            pe_sectors: PE_SECTORS,
            pe_count: 255,
            ba_start: 2048,
            ba_size: 2048,
        }
    }

    #[test]
    fn round_trip_is_canonical() {
        let cfg = initial_vg_config(&sample_vg());
        let text = serialize(&cfg);
        let reparsed = parse(&text).unwrap();
        assert_eq!(cfg, reparsed);
        assert_eq!(serialize(&reparsed), text);
    }

    #[test]
    fn initial_config_layout() {
        let text = serialize(&initial_vg_config(&sample_vg()));
        assert!(text.starts_with("contents = \"Text Format Volume Group\"\n"));
        assert!(text.contains("extent_size = 8192"));
        assert!(text.contains("pe_count = 255"));
        // Segment 1: the relocated first PE, at the end of the PV.
        assert!(text.contains("stripes = [\"pv0\", 254]"));
        // Segment 2: the untouched remainder.
        assert!(text.contains("stripes = [\"pv0\", 0]"));
        assert!(text.contains("segment_count = 2"));
    }

    #[test]
    fn parses_real_vgcfgbackup_output() {
        let text = r#"# Generated by LVM2: some date
contents = "Text Format Volume Group"
version = 1

description = "Created *after* executing 'vgcfgbackup'"

creation_host = "host"	# Linux host
creation_time = 1722000000	# some date

vg0 {
	id = "aaaaaa-aaaa"
	seqno = 3
	format = "lvm2"			# informational
	status = ["RESIZEABLE", "READ", "WRITE"]
	flags = []
	extent_size = 8192
	max_lv = 0
	max_pv = 0
	metadata_copies = 0

	physical_volumes {

		pv0 {
			id = "bbbbbb-bbbb"
			device = "/dev/loop0"	# Hint only

			status = ["ALLOCATABLE"]
			flags = []
			dev_size = 131072
			pe_start = 8192
			pe_count = 15
		}
	}

	logical_volumes {

		lv1 {
			id = "cccccc-cccc"
			status = ["READ", "WRITE", "VISIBLE"]
			flags = []
			segment_count = 1

			segment1 {
				start_extent = 0
				extent_count = 15

				type = "striped"
				stripe_count = 1	# linear

				stripes = [
					"pv0", 0
				]
			}
		}
	}
}
"#;
        let cfg = parse(text).unwrap();
        let vg = match get(&cfg, "vg0") {
            Some(Value::Section(vg)) => vg,
            _ => panic!("vg0 missing"),
        };
        assert_eq!(get_int(vg, "extent_size").unwrap(), 8192);
        // Comments are dropped, structure survives a round trip.
        let reparsed = parse(&serialize(&cfg)).unwrap();
        assert_eq!(cfg, reparsed);
    }

    fn lv_segments(cfg: &Section, vgname: &str, lvname: &str) -> Vec<Segment> {
        let vg = match get(cfg, vgname) {
            Some(Value::Section(vg)) => vg,
            _ => panic!("missing vg"),
        };
        let lvs = match get(vg, "logical_volumes") {
            Some(Value::Section(lvs)) => lvs,
            _ => panic!("missing logical_volumes"),
        };
        let lv = match get(lvs, lvname) {
            Some(Value::Section(lv)) => lv,
            _ => panic!("missing lv"),
        };
        read_segments(lv).unwrap()
    }

    #[test]
    fn forward_rotation_moves_the_first_extent_to_the_end() {
        let mut cfg = initial_vg_config(&sample_vg());
        let size = 255 * 4 * 1024 * 1024;
        rotate(&mut cfg, "vg.loop0", "lv1", true, size).unwrap();

        let segments = lv_segments(&cfg, "vg.loop0", "lv1");
        // The two-segment rotated layout collapses into the identity
        // mapping: logical extent i on physical extent i, one segment.
        assert_eq!(
            segments,
            vec![Segment {
                start_extent: 0,
                extent_count: 255,
                pv: "pv0".into(),
                pv_offset: 0
            }]
        );
    }

    #[test]
    fn backward_rotation_moves_the_last_extent_to_the_front() {
        let mut cfg = initial_vg_config(&sample_vg());
        let size = 255 * 4 * 1024 * 1024;
        rotate(&mut cfg, "vg.loop0", "lv1", true, size).unwrap();
        rotate(&mut cfg, "vg.loop0", "lv1", false, size).unwrap();

        // Back to the original two-segment layout.
        let segments = lv_segments(&cfg, "vg.loop0", "lv1");
        assert_eq!(
            segments,
            vec![
                Segment {
                    start_extent: 0,
                    extent_count: 1,
                    pv: "pv0".into(),
                    pv_offset: 254
                },
                Segment {
                    start_extent: 1,
                    extent_count: 254,
                    pv: "pv0".into(),
                    pv_offset: 0
                },
            ]
        );
    }

    #[test]
    fn rotation_is_self_inverting_on_the_serialized_form() {
        let size = 255 * 4 * 1024 * 1024;
        for forward in [true, false] {
            let cfg = initial_vg_config(&sample_vg());
            let original = serialize(&cfg);

            let mut rotated = parse(&original).unwrap();
            rotate(&mut rotated, "vg.loop0", "lv1", forward, size).unwrap();
            let there = serialize(&rotated);
            assert_ne!(there, original);

            let mut back = parse(&there).unwrap();
            rotate(&mut back, "vg.loop0", "lv1", !forward, size).unwrap();
            assert_eq!(serialize(&back), original);
        }
    }

    #[test]
    fn backward_rotation_on_a_plain_lv() {
        // The bcache LV conversion: one linear segment, the last PE
        // (which carries the new superblock) rotates to the front.
        let text = "\
contents = \"Text Format Volume Group\"
version = 1
vg0 {
\textent_size = 8192
\tlogical_volumes {
\t\tlv1 {
\t\t\tsegment_count = 1
\t\t\tsegment1 {
\t\t\t\tstart_extent = 0
\t\t\t\textent_count = 16
\t\t\t\ttype = \"striped\"
\t\t\t\tstripe_count = 1
\t\t\t\tstripes = [\"pv0\", 0]
\t\t\t}
\t\t}
\t}
}
";
        let original = serialize(&parse(text).unwrap());
        let mut cfg = parse(&original).unwrap();
        let size = 16 * 4 * 1024 * 1024;
        rotate(&mut cfg, "vg0", "lv1", false, size).unwrap();

        let rotated = serialize(&cfg);
        assert!(rotated.contains("stripes = [\"pv0\", 15]"));
        assert!(rotated.contains("segment_count = 2"));

        // The inverse reproduces the original byte for byte.
        let mut back = parse(&rotated).unwrap();
        rotate(&mut back, "vg0", "lv1", true, size).unwrap();
        assert_eq!(serialize(&back), original);
    }

    #[test]
    fn rotation_rejects_a_single_extent() {
        let text = "\
contents = \"Text Format Volume Group\"
version = 1
vg0 {
\textent_size = 8192
\tlogical_volumes {
\t\tlv1 {
\t\t\tsegment_count = 1
\t\t\tsegment1 {
\t\t\t\tstart_extent = 0
\t\t\t\textent_count = 1
\t\t\t\ttype = \"striped\"
\t\t\t\tstripe_count = 1
\t\t\t\tstripes = [\"pv0\", 0]
\t\t\t}
\t\t}
\t}
}
";
        let mut cfg = parse(text).unwrap();
        assert!(rotate(&mut cfg, "vg0", "lv1", true, 4 * 1024 * 1024).is_err());
    }

    #[test]
    fn rotation_rejects_size_mismatch() {
        let mut cfg = initial_vg_config(&sample_vg());
        assert!(rotate(&mut cfg, "vg.loop0", "lv1", true, 8 * 1024 * 1024).is_err());
    }

    /// Expand segments into one (pv, offset) entry per logical extent.
    fn extent_map(segments: &[Segment]) -> Vec<(String, u64)> {
        let mut sorted = segments.to_vec();
        sorted.sort_by_key(|s| s.start_extent);
        let mut map = Vec::new();
        for seg in sorted {
            assert_eq!(seg.start_extent, map.len() as u64, "segment gap");
            for i in 0..seg.extent_count {
                map.push((seg.pv.clone(), seg.pv_offset + i));
            }
        }
        map
    }

    #[test]
    fn rotation_many_times_cycles_all_extents() {
        // The LV spans every PV extent, so pe_count forward rotations
        // bring the logical mapping back to where it started. The
        // segmentation may end up sliced differently; the mapping is
        // what matters for data integrity.
        let mut vg = sample_vg();
        vg.pe_count = 5;
        let mut cfg = initial_vg_config(&vg);
        let size = 5 * 4 * 1024 * 1024;
        let original = extent_map(&lv_segments(&cfg, "vg.loop0", "lv1"));
        for round in 1..=5 {
            rotate(&mut cfg, "vg.loop0", "lv1", true, size).unwrap();
            let rotated = extent_map(&lv_segments(&cfg, "vg.loop0", "lv1"));
            if round < 5 {
                assert_ne!(rotated, original);
            } else {
                assert_eq!(rotated, original);
            }
        }
    }
}
