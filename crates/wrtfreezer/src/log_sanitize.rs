// Build tool output is forwarded into structured logs; keep it to printable text.

const MAX_LOG_CHARS: usize = 2048;

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Esc,
    // CSI: ends at a final byte in '@'..='~'.
    Csi,
    // OSC: ends at BEL or ESC '\'.
    Osc,
    // DCS/SOS/PM/APC: end at ESC '\'.
    Str,
    // Saw ESC inside an OSC or string sequence.
    StrEsc { osc: bool },
}

pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut state = State::Text;
    let mut count = 0usize;

    for c in input.chars() {
        state = match state {
            State::Text => {
                if c == '\x1b' {
                    State::Esc
                } else {
                    if c == '\t' {
                        out.push(' ');
                        count += 1;
                    } else if !c.is_control() && !is_bidi_control(c) {
                        out.push(c);
                        count += 1;
                    }
                    if count >= MAX_LOG_CHARS {
                        out.push_str(" ...[truncated]");
                        return out;
                    }
                    State::Text
                }
            }
            State::Esc => match c {
                '[' => State::Csi,
                ']' => State::Osc,
                'P' | 'X' | '^' | '_' => State::Str,
                _ => State::Text,
            },
            State::Csi if ('@'..='~').contains(&c) => State::Text,
            State::Csi => State::Csi,
            State::Osc if c == '\x07' => State::Text,
            State::Osc | State::Str if c == '\x1b' => State::StrEsc {
                osc: state == State::Osc,
            },
            State::Osc => State::Osc,
            State::Str => State::Str,
            State::StrEsc { .. } if c == '\\' => State::Text,
            State::StrEsc { osc } if c == '\x1b' => State::StrEsc { osc },
            State::StrEsc { osc: true } => State::Osc,
            State::StrEsc { osc: false } => State::Str,
        };
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
