//! Card-command parsing for the yetty OSC envelope.
//!
//! Every card command travels as `ESC ] 666666 ; generic ; card-args ;
//! payload ST`. Only the first three unprotected semicolons split fields;
//! quoted strings and `{}` groups protect inner semicolons, and the payload
//! may contain them freely (it is base64). Parsing never fails hard: a
//! malformed sequence yields an [`OscCommand`] carrying an error string that
//! the dispatcher echoes back as `error: ...` on the TTY.

use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::{alphabet, Engine as _};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Vendor id carried in field 0. Sequences with any other vendor pass
/// through the terminal untouched.
pub const VENDOR_ID: u64 = 666666;

const ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LENGTH: usize = 8;

/// `run` arguments: grid placement plus card type and optional user name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    pub x: i32,
    pub y: i32,
    /// 0 = stretch to the terminal edge.
    pub width: u32,
    /// 0 = stretch to the terminal edge.
    pub height: u32,
    pub card: String,
    /// User-assigned name for registry lookup; empty = auto-generate.
    pub name: String,
    /// Position relative to the cursor.
    pub relative: bool,
}

/// `ls` arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListArgs {
    /// Include stopped cards.
    pub all: bool,
}

/// Targeting for `kill`/`stop`/`start`/`update`: at least one selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetArgs {
    /// Specific card by 8-char id.
    pub id: Option<String>,
    /// Specific card by registered name.
    pub name: Option<String>,
    /// Every card of a type.
    pub card: Option<String>,
}

impl TargetArgs {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.card.is_none()
    }
}

/// `help` arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelpArgs {
    pub card: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Run(RunArgs),
    List(ListArgs),
    Cards,
    Kill(TargetArgs),
    Stop(TargetArgs),
    Start(TargetArgs),
    Update(TargetArgs),
    Help(HelpArgs),
    Unknown,
}

/// A parsed OSC card command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscCommand {
    pub kind: CommandKind,
    /// Field 2 verbatim: card-specific raw argument string.
    pub card_args: String,
    /// Field 3 after base64 decode.
    pub payload: Vec<u8>,
    /// Parse failure, echoed back as `error: ...`.
    pub error: Option<String>,
}

impl OscCommand {
    pub fn is_valid(&self) -> bool {
        !matches!(self.kind, CommandKind::Unknown) && self.error.is_none()
    }

    fn invalid(error: impl Into<String>) -> Self {
        OscCommand {
            kind: CommandKind::Unknown,
            card_args: String::new(),
            payload: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Render back into the sequence body (`vendor;generic;card-args;payload`).
    /// Inverse of [`OscCommandParser::parse`] for valid commands.
    pub fn serialize(&self) -> String {
        let generic = match &self.kind {
            CommandKind::Run(run) => {
                let mut s = format!(
                    "run -c {} -x {} -y {} -w {} -h {}",
                    quote(&run.card),
                    run.x,
                    run.y,
                    run.width,
                    run.height
                );
                if run.relative {
                    s.push_str(" -r");
                }
                if !run.name.is_empty() {
                    s.push_str(" --name ");
                    s.push_str(&quote(&run.name));
                }
                s
            }
            CommandKind::List(list) => {
                if list.all {
                    "ls --all".to_string()
                } else {
                    "ls".to_string()
                }
            }
            CommandKind::Cards => "cards".to_string(),
            CommandKind::Kill(t) => serialize_target("kill", t),
            CommandKind::Stop(t) => serialize_target("stop", t),
            CommandKind::Start(t) => serialize_target("start", t),
            CommandKind::Update(t) => serialize_target("update", t),
            CommandKind::Help(h) => format!("help -c {}", quote(&h.card)),
            CommandKind::Unknown => String::new(),
        };
        format!(
            "{VENDOR_ID};{generic};{};{}",
            self.card_args,
            base64_encode(&self.payload)
        )
    }
}

fn serialize_target(cmd: &str, t: &TargetArgs) -> String {
    let mut s = cmd.to_string();
    if let Some(id) = &t.id {
        s.push_str(" --id ");
        s.push_str(&quote(id));
    }
    if let Some(name) = &t.name {
        s.push_str(" --name ");
        s.push_str(&quote(name));
    }
    if let Some(card) = &t.card {
        s.push_str(" --card ");
        s.push_str(&quote(card));
    }
    s
}

fn quote(value: &str) -> String {
    if value.contains(' ') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Parser for OSC card command sequences, plus card-id generation.
pub struct OscCommandParser {
    rng: SmallRng,
}

impl Default for OscCommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OscCommandParser {
    pub fn new() -> Self {
        // Seeded from the high-resolution clock, as ids only need to be
        // unique within one terminal's live card set.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e3779b97f4a7c15);
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Generate a random 8-character lowercase-alphanumeric card id.
    pub fn generate_id(&mut self) -> String {
        let dist = Uniform::from(0..ID_CHARS.len());
        (0..ID_LENGTH)
            .map(|_| ID_CHARS[dist.sample(&mut self.rng)] as char)
            .collect()
    }

    /// Parse a sequence body (without the `ESC ]` prefix and terminator).
    /// Format: `vendor;generic;card-args;payload`.
    pub fn parse(&self, sequence: &str) -> OscCommand {
        let fields = split_fields(sequence);
        if fields.len() < 2 {
            return OscCommand::invalid("invalid sequence: expected at least vendor-id and command");
        }

        let vendor: u64 = match fields[0].trim().parse() {
            Ok(v) => v,
            Err(_) => return OscCommand::invalid("invalid vendor ID"),
        };
        if vendor != VENDOR_ID {
            return OscCommand::invalid(format!("unknown vendor ID: {vendor}"));
        }

        let tokens = tokenize(&fields[1]);
        if tokens.is_empty() {
            return OscCommand::invalid("empty command");
        }

        let kind = match parse_generic(&tokens) {
            Ok(kind) => kind,
            Err(error) => return OscCommand::invalid(error),
        };

        let card_args = fields.get(2).cloned().unwrap_or_default();
        let payload = fields
            .get(3)
            .map(|f| base64_decode(f))
            .unwrap_or_default();

        OscCommand {
            kind,
            card_args,
            payload,
            error: None,
        }
    }
}

/// Split into at most 4 fields on the first 3 unprotected semicolons.
/// Quoted strings and `{}` groups protect inner semicolons; the trailing
/// payload field may contain semicolons freely.
fn split_fields(sequence: &str) -> Vec<String> {
    let mut fields = Vec::with_capacity(4);
    let mut start = 0;
    let mut in_quotes = false;
    let mut brace_depth: i32 = 0;

    for (i, c) in sequence.char_indices() {
        if fields.len() == 3 {
            break;
        }
        match c {
            '"' | '\'' => in_quotes = !in_quotes,
            '{' if !in_quotes => brace_depth += 1,
            '}' if !in_quotes => brace_depth -= 1,
            ';' if !in_quotes && brace_depth == 0 => {
                fields.push(sequence[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < sequence.len() {
        fields.push(sequence[start..].to_string());
    }
    fields
}

/// Split on spaces, keeping double-quoted runs as single tokens.
pub(crate) fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in s.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_generic(tokens: &[String]) -> Result<CommandKind, String> {
    match tokens[0].as_str() {
        // "create" kept for backwards compatibility, "run" is preferred.
        "run" | "create" => parse_run(tokens)
            .map(CommandKind::Run)
            .map_err(|e| format!("run: {e}")),
        "ls" | "list" => parse_list(tokens)
            .map(CommandKind::List)
            .map_err(|e| format!("ls: {e}")),
        // "plugins" kept for backwards compatibility.
        "cards" | "plugins" => Ok(CommandKind::Cards),
        "kill" => parse_target(tokens)
            .map(CommandKind::Kill)
            .map_err(|e| format!("kill: {e}")),
        "stop" => parse_target(tokens)
            .map(CommandKind::Stop)
            .map_err(|e| format!("stop: {e}")),
        "start" => parse_target(tokens)
            .map(CommandKind::Start)
            .map_err(|e| format!("start: {e}")),
        "update" => parse_target(tokens)
            .map(CommandKind::Update)
            .map_err(|e| format!("update: {e}")),
        "help" => parse_help(tokens)
            .map(CommandKind::Help)
            .map_err(|e| format!("help: {e}")),
        other => Err(format!("unknown command: {other}")),
    }
}

fn value<'a>(tokens: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    tokens
        .get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn int_value<T: std::str::FromStr>(
    tokens: &[String],
    i: &mut usize,
    flag: &str,
) -> Result<T, String> {
    let raw = value(tokens, i, flag)?;
    raw.parse()
        .map_err(|_| format!("invalid value for {flag}: {raw}"))
}

fn parse_run(tokens: &[String]) -> Result<RunArgs, String> {
    let mut args = RunArgs::default();
    let mut i = 1;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "-x" | "--x-pos" => args.x = int_value(tokens, &mut i, "-x")?,
            "-y" | "--y-pos" => args.y = int_value(tokens, &mut i, "-y")?,
            "-w" | "--width" => args.width = int_value(tokens, &mut i, "-w")?,
            "-h" | "--height" => args.height = int_value(tokens, &mut i, "-h")?,
            // -p/--plugin kept for backwards compatibility.
            "-c" | "--card" | "-p" | "--plugin" => {
                args.card = value(tokens, &mut i, "-c")?.to_string();
            }
            "-r" | "--relative" => args.relative = true,
            "-n" | "--name" => args.name = value(tokens, &mut i, "--name")?.to_string(),
            other => return Err(format!("unknown option: {other}")),
        }
        i += 1;
    }
    if args.card.is_empty() {
        return Err("--card/-c is required".to_string());
    }
    Ok(args)
}

fn parse_list(tokens: &[String]) -> Result<ListArgs, String> {
    let mut args = ListArgs::default();
    for token in &tokens[1..] {
        match token.as_str() {
            "-a" | "--all" => args.all = true,
            other => return Err(format!("unknown option: {other}")),
        }
    }
    Ok(args)
}

fn parse_target(tokens: &[String]) -> Result<TargetArgs, String> {
    let mut args = TargetArgs::default();
    let mut i = 1;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "--id" => args.id = Some(value(tokens, &mut i, "--id")?.to_string()),
            "-n" | "--name" => args.name = Some(value(tokens, &mut i, "--name")?.to_string()),
            "-c" | "--card" | "-p" | "--plugin" => {
                args.card = Some(value(tokens, &mut i, "--card")?.to_string());
            }
            other => return Err(format!("unknown option: {other}")),
        }
        i += 1;
    }
    if args.is_empty() {
        return Err("--id, --name, or --card is required".to_string());
    }
    Ok(args)
}

fn parse_help(tokens: &[String]) -> Result<HelpArgs, String> {
    let mut args = HelpArgs::default();
    let mut i = 1;
    while i < tokens.len() {
        match tokens[i].as_str() {
            "-c" | "--card" | "-p" | "--plugin" => {
                args.card = value(tokens, &mut i, "--card")?.to_string();
            }
            other => return Err(format!("unknown option: {other}")),
        }
        i += 1;
    }
    if args.card.is_empty() {
        return Err("--card/-c is required".to_string());
    }
    Ok(args)
}

/// Standard base64 with padding.
pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decoder for payloads from arbitrary shells: padding already stripped,
/// trailing bits ignored rather than rejected.
const FORGIVING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Forgiving base64 decode: padding is tolerated, bytes outside the alphabet
/// are silently skipped, and a trailing 6-bit remainder is dropped.
pub fn base64_decode(encoded: &str) -> Vec<u8> {
    let mut filtered: Vec<u8> = encoded
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
        .collect();
    // A single leftover sextet carries no complete byte.
    if filtered.len() % 4 == 1 {
        filtered.pop();
    }
    FORGIVING.decode(&filtered).unwrap_or_default()
}

/// Reply text builders. Replies go back on the TTY as plain newline-
/// terminated text, never wrapped in OSC.
pub struct OscResponse;

/// One row of the `ls` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardListEntry {
    pub id: String,
    pub type_name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub running: bool,
}

impl OscResponse {
    pub fn success(message: &str) -> String {
        if message.is_empty() {
            // Silent success.
            String::new()
        } else {
            format!("{message}\n")
        }
    }

    pub fn error(message: &str) -> String {
        format!("error: {message}\n")
    }

    pub fn card_list(cards: &[CardListEntry]) -> String {
        if cards.is_empty() {
            return "no cards\n".to_string();
        }
        let mut out = String::new();
        out.push_str("ID        TYPE            X     Y     W     H  STATE\n");
        out.push_str("--------  --------------  ----  ----  ----  ----  -------\n");
        for c in cards {
            out.push_str(&format!(
                "{:<8}  {:<14}  {:>4}  {:>4}  {:>4}  {:>4}  {}\n",
                c.id,
                c.type_name,
                c.x,
                c.y,
                c.width,
                c.height,
                if c.running { "running" } else { "stopped" },
            ));
        }
        out
    }

    pub fn type_list(types: &[String]) -> String {
        if types.is_empty() {
            return "no card types available\n".to_string();
        }
        let mut out = String::from("available cards:\n");
        for name in types {
            out.push_str("  ");
            out.push_str(name);
            out.push('\n');
        }
        out
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse(seq: &str) -> OscCommand {
        OscCommandParser::new().parse(seq)
    }

    #[test]
    fn parses_full_run_command() {
        let cmd = parse("666666;run -c plot -x 0 -y 0 -w 80 -h 20 -r --name audio;--buffer waveform=400;");
        assert!(cmd.is_valid());
        let CommandKind::Run(run) = &cmd.kind else {
            panic!("expected run, got {:?}", cmd.kind);
        };
        assert_eq!(run.card, "plot");
        assert_eq!((run.x, run.y, run.width, run.height), (0, 0, 80, 20));
        assert!(run.relative);
        assert_eq!(run.name, "audio");
        assert_eq!(cmd.card_args, "--buffer waveform=400");
        assert!(cmd.payload.is_empty());
    }

    #[test]
    fn run_without_card_is_an_error() {
        let cmd = parse("666666;run -w 80");
        assert!(!cmd.is_valid());
        assert_eq!(cmd.error.as_deref(), Some("run: --card/-c is required"));
    }

    #[test]
    fn wrong_vendor_is_rejected() {
        let cmd = parse("123456;ls");
        assert!(!cmd.is_valid());
        assert_eq!(cmd.error.as_deref(), Some("unknown vendor ID: 123456"));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let cmd = parse("666666;teleport");
        assert_eq!(cmd.error.as_deref(), Some("unknown command: teleport"));
    }

    #[test]
    fn target_requires_a_selector() {
        let cmd = parse("666666;kill");
        assert_eq!(
            cmd.error.as_deref(),
            Some("kill: --id, --name, or --card is required")
        );
        let cmd = parse("666666;kill --name chart");
        let CommandKind::Kill(target) = &cmd.kind else {
            panic!("expected kill");
        };
        assert_eq!(target.name.as_deref(), Some("chart"));
    }

    #[test]
    fn backwards_compatible_aliases() {
        assert!(matches!(
            parse("666666;create -c plot").kind,
            CommandKind::Run(_)
        ));
        assert!(matches!(
            parse("666666;list --all").kind,
            CommandKind::List(ListArgs { all: true })
        ));
        assert!(matches!(parse("666666;plugins").kind, CommandKind::Cards));
        let cmd = parse("666666;run -p image");
        let CommandKind::Run(run) = &cmd.kind else {
            panic!("expected run");
        };
        assert_eq!(run.card, "image");
    }

    #[test]
    fn payload_semicolons_survive_roundtrip() {
        let payload = b"a;b;c;{x;y}";
        let seq = format!("666666;run -c ytext;;{}", base64_encode(payload));
        let cmd = parse(&seq);
        assert!(cmd.is_valid());
        assert_eq!(cmd.payload, payload);
    }

    #[test]
    fn quoted_and_braced_semicolons_protect_fields() {
        let cmd = parse("666666;run -c ytext --name \"a;b\";{k;v} trailing;");
        assert!(cmd.is_valid(), "{:?}", cmd.error);
        let CommandKind::Run(run) = &cmd.kind else {
            panic!("expected run");
        };
        assert_eq!(run.name, "a;b");
        assert_eq!(cmd.card_args, "{k;v} trailing");
    }

    #[test]
    fn base64_decode_is_forgiving() {
        assert_eq!(base64_decode("aGVsbG8="), b"hello");
        assert_eq!(base64_decode("aGV sbG8\n="), b"hello");
        assert_eq!(base64_decode("aGVsbG8"), b"hello");
        assert_eq!(base64_decode(""), b"");
        assert_eq!(base64_decode("!!!"), b"");
    }

    #[test]
    fn generated_ids_are_well_formed() {
        let mut parser = OscCommandParser::new();
        for _ in 0..64 {
            let id = parser.generate_id();
            assert_eq!(id.len(), 8);
            assert!(id.bytes().all(|b| ID_CHARS.contains(&b)));
        }
    }

    #[test]
    fn error_response_has_prefix_and_newline() {
        assert_eq!(OscResponse::error("run: --card/-c is required"),
            "error: run: --card/-c is required\n");
        assert_eq!(OscResponse::success(""), "");
        assert_eq!(OscResponse::success("ok"), "ok\n");
    }

    #[test]
    fn card_list_table_is_fixed_column() {
        let rows = vec![CardListEntry {
            id: "a1b2c3d4".into(),
            type_name: "plot".into(),
            x: 0,
            y: 12,
            width: 80,
            height: 20,
            running: true,
        }];
        let table = OscResponse::card_list(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("a1b2c3d4  plot"));
        assert!(lines[2].ends_with("running"));
        assert_eq!(OscResponse::card_list(&[]), "no cards\n");
    }

    fn ident() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    fn target_strategy() -> impl Strategy<Value = TargetArgs> {
        (
            prop::option::of(ident()),
            prop::option::of(ident()),
            prop::option::of(ident()),
        )
            .prop_filter_map("needs a selector", |(id, name, card)| {
                let t = TargetArgs { id, name, card };
                (!t.is_empty()).then_some(t)
            })
    }

    fn command_strategy() -> impl Strategy<Value = OscCommand> {
        let kind = prop_oneof![
            (
                any::<i16>(),
                any::<i16>(),
                0u32..10_000,
                0u32..10_000,
                ident(),
                prop::option::of(ident()),
                any::<bool>(),
            )
                .prop_map(|(x, y, w, h, card, name, relative)| {
                    CommandKind::Run(RunArgs {
                        x: x as i32,
                        y: y as i32,
                        width: w,
                        height: h,
                        card,
                        name: name.unwrap_or_default(),
                        relative,
                    })
                }),
            any::<bool>().prop_map(|all| CommandKind::List(ListArgs { all })),
            Just(CommandKind::Cards),
            target_strategy().prop_map(CommandKind::Kill),
            target_strategy().prop_map(CommandKind::Stop),
            target_strategy().prop_map(CommandKind::Start),
            target_strategy().prop_map(CommandKind::Update),
            ident().prop_map(|card| CommandKind::Help(HelpArgs { card })),
        ];
        (
            kind,
            "[a-zA-Z0-9 =_-]{0,24}",
            prop::collection::vec(any::<u8>(), 0..64),
        )
            .prop_map(|(kind, card_args, payload)| OscCommand {
                kind,
                card_args,
                payload,
                error: None,
            })
    }

    proptest! {
        #[test]
        fn serialize_parse_roundtrip(cmd in command_strategy()) {
            let parsed = OscCommandParser::new().parse(&cmd.serialize());
            prop_assert_eq!(parsed, cmd);
        }

        #[test]
        fn base64_roundtrip(data in prop::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(base64_decode(&base64_encode(&data)), data);
        }
    }
}
