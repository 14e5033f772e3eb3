//! TeX-ish math to plain Unicode for the terminal.
//!
//! Only a small subset is understood: Greek letters, common operators and
//! relations, `^`/`_` scripts, `\frac`, `\sqrt`, `\text` and friends.
//! Anything else is reported as an error so the caller can show the source.

/// One math fragment cut out of a comment body, without its delimiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MathNode {
    pub source: String,
    pub display: bool,
}

impl MathNode {
    pub fn inline(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            display: false,
        }
    }

    pub fn display(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            display: true,
        }
    }

    /// The fragment as the author wrote it, delimiters included.
    pub fn delimited(&self) -> String {
        if self.display {
            format!("$${}$$", self.source)
        } else {
            format!("${}$", self.source)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MathError {
    #[error("unknown command \\{0}")]
    UnknownCommand(String),
    #[error("unbalanced braces")]
    UnbalancedBraces,
    #[error("script is missing its argument")]
    DanglingScript,
    #[error("\\{0} is missing an argument")]
    MissingArgument(String),
    #[error("expression is nested too deeply")]
    TooDeep,
}

pub trait Typesetter: Send + Sync {
    fn typeset(&self, node: &MathNode) -> Result<String, MathError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnicodeTypesetter;

impl Typesetter for UnicodeTypesetter {
    fn typeset(&self, node: &MathNode) -> Result<String, MathError> {
        let mut parser = Parser::new(&node.source);
        let out = parser.sequence(false)?;
        Ok(out.trim().to_string())
    }
}

/// Groups, command arguments and script arguments all count as one level.
const MAX_DEPTH: usize = 64;

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self::nested(source, 0)
    }

    fn nested(source: &str, depth: usize) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            depth,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// Everything up to the end of input, or up to the closing brace when
    /// `in_group` is set.
    fn sequence(&mut self, in_group: bool) -> Result<String, MathError> {
        let mut out = String::new();
        loop {
            match self.peek() {
                None if in_group => return Err(MathError::UnbalancedBraces),
                None => return Ok(out),
                Some('}') if in_group => {
                    self.bump();
                    return Ok(out.trim().to_string());
                }
                Some('}') => return Err(MathError::UnbalancedBraces),
                Some(c @ ('^' | '_')) => {
                    self.bump();
                    let arg = self.script_argument()?;
                    out.push_str(&script(&arg, c == '^'));
                }
                Some(c) if c.is_whitespace() => {
                    self.skip_whitespace();
                    if !out.is_empty() && !out.ends_with(' ') {
                        out.push(' ');
                    }
                }
                Some(_) => {
                    let atom = self.atom()?;
                    out.push_str(&atom);
                }
            }
        }
    }

    fn script_argument(&mut self) -> Result<String, MathError> {
        self.skip_whitespace();
        match self.peek() {
            None | Some('}' | '^' | '_') => Err(MathError::DanglingScript),
            Some(_) => self.atom(),
        }
    }

    fn required_argument(&mut self, command: &str) -> Result<String, MathError> {
        self.skip_whitespace();
        match self.peek() {
            None | Some('}') => Err(MathError::MissingArgument(command.to_string())),
            Some(_) => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<String, MathError> {
        if self.depth >= MAX_DEPTH {
            return Err(MathError::TooDeep);
        }
        self.depth += 1;
        let out = self.atom_inner();
        self.depth -= 1;
        out
    }

    fn atom_inner(&mut self) -> Result<String, MathError> {
        match self.bump() {
            Some('{') => self.sequence(true),
            Some('\\') => self.command(),
            Some('\'') => Ok("′".to_string()),
            Some('*') => Ok("∗".to_string()),
            Some(c) => Ok(c.to_string()),
            None => Ok(String::new()),
        }
    }

    /// Verbatim contents of a `{...}` group, nested braces included.
    fn raw_group(&mut self, command: &str) -> Result<String, MathError> {
        self.skip_whitespace();
        if self.peek() != Some('{') {
            return Err(MathError::MissingArgument(command.to_string()));
        }
        self.bump();
        let mut depth = 1usize;
        let mut out = String::new();
        while let Some(c) = self.bump() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                }
                _ => {}
            }
            out.push(c);
        }
        Err(MathError::UnbalancedBraces)
    }

    fn optional_index(&mut self) -> Result<Option<String>, MathError> {
        if self.peek() != Some('[') {
            return Ok(None);
        }
        self.bump();
        let mut raw = String::new();
        loop {
            match self.bump() {
                Some(']') => break,
                Some(c) => raw.push(c),
                None => return Err(MathError::UnbalancedBraces),
            }
        }
        let index = Parser::nested(&raw, self.depth + 1).sequence(false)?;
        Ok(Some(index.trim().to_string()))
    }

    fn command(&mut self) -> Result<String, MathError> {
        let mut name = String::new();
        while let Some(c) = self.peek().filter(char::is_ascii_alphabetic) {
            name.push(c);
            self.pos += 1;
        }

        if name.is_empty() {
            let c = self
                .bump()
                .ok_or_else(|| MathError::UnknownCommand(String::new()))?;
            return match c {
                '{' | '}' | '$' | '%' | '&' | '#' | '_' => Ok(c.to_string()),
                ',' | ';' | ':' | ' ' | '\\' => Ok(" ".to_string()),
                '!' => Ok(String::new()),
                '|' => Ok("‖".to_string()),
                other => Err(MathError::UnknownCommand(other.to_string())),
            };
        }

        if let Some(symbol) = symbol(&name) {
            return Ok(symbol.to_string());
        }
        if FUNCTIONS.contains(&name.as_str()) {
            return Ok(name);
        }

        match name.as_str() {
            "frac" | "dfrac" | "tfrac" => {
                let numerator = self.required_argument(&name)?;
                let denominator = self.required_argument(&name)?;
                Ok(fraction(&numerator, &denominator))
            }
            "sqrt" => {
                let index = self.optional_index()?;
                let body = self.required_argument(&name)?;
                let radical = match index.as_deref() {
                    None | Some("") | Some("2") => "√".to_string(),
                    Some("3") => "∛".to_string(),
                    Some("4") => "∜".to_string(),
                    Some(other) => format!("{}√", script(other, true)),
                };
                Ok(format!("{radical}{}", parenthesize(&body)))
            }
            "text" | "textrm" | "textbf" | "textit" | "mathrm" | "mathbf" | "mathit"
            | "operatorname" => self.raw_group(&name),
            "mathbb" => {
                let arg = self.required_argument(&name)?;
                Ok(arg.chars().map(double_struck).collect())
            }
            "vec" => self.accent(&name, '\u{20D7}'),
            "hat" | "widehat" => self.accent(&name, '\u{0302}'),
            "bar" | "overline" => self.accent(&name, '\u{0305}'),
            "tilde" | "widetilde" => self.accent(&name, '\u{0303}'),
            "dot" => self.accent(&name, '\u{0307}'),
            "left" | "right" | "big" | "Big" | "bigl" | "bigr" | "Bigl" | "Bigr" => {
                // `\left.` is an invisible delimiter.
                if self.peek() == Some('.') {
                    self.bump();
                }
                Ok(String::new())
            }
            "quad" => Ok("  ".to_string()),
            "qquad" => Ok("    ".to_string()),
            _ => Err(MathError::UnknownCommand(name)),
        }
    }

    fn accent(&mut self, command: &str, mark: char) -> Result<String, MathError> {
        let arg = self.required_argument(command)?;
        let mut out = String::new();
        for c in arg.chars() {
            out.push(c);
            out.push(mark);
        }
        Ok(out)
    }
}

const FUNCTIONS: &[&str] = &[
    "sin", "cos", "tan", "cot", "sec", "csc", "arcsin", "arccos", "arctan", "sinh", "cosh",
    "tanh", "log", "ln", "lg", "exp", "lim", "max", "min", "sup", "inf", "det", "gcd", "deg",
    "dim", "ker", "arg", "mod", "Pr",
];

fn symbol(name: &str) -> Option<&'static str> {
    let symbol = match name {
        "alpha" => "α",
        "beta" => "β",
        "gamma" => "γ",
        "delta" => "δ",
        "epsilon" => "ϵ",
        "varepsilon" => "ε",
        "zeta" => "ζ",
        "eta" => "η",
        "theta" => "θ",
        "vartheta" => "ϑ",
        "iota" => "ι",
        "kappa" => "κ",
        "lambda" => "λ",
        "mu" => "μ",
        "nu" => "ν",
        "xi" => "ξ",
        "pi" => "π",
        "varpi" => "ϖ",
        "rho" => "ρ",
        "sigma" => "σ",
        "varsigma" => "ς",
        "tau" => "τ",
        "upsilon" => "υ",
        "phi" => "ϕ",
        "varphi" => "φ",
        "chi" => "χ",
        "psi" => "ψ",
        "omega" => "ω",
        "Gamma" => "Γ",
        "Delta" => "Δ",
        "Theta" => "Θ",
        "Lambda" => "Λ",
        "Xi" => "Ξ",
        "Pi" => "Π",
        "Sigma" => "Σ",
        "Upsilon" => "Υ",
        "Phi" => "Φ",
        "Psi" => "Ψ",
        "Omega" => "Ω",
        "times" => "×",
        "cdot" => "·",
        "div" => "÷",
        "pm" => "±",
        "mp" => "∓",
        "ast" => "∗",
        "star" => "⋆",
        "circ" => "∘",
        "bullet" => "•",
        "leq" | "le" => "≤",
        "geq" | "ge" => "≥",
        "neq" | "ne" => "≠",
        "ll" => "≪",
        "gg" => "≫",
        "approx" => "≈",
        "equiv" => "≡",
        "sim" => "∼",
        "simeq" => "≃",
        "cong" => "≅",
        "propto" => "∝",
        "infty" => "∞",
        "partial" => "∂",
        "nabla" => "∇",
        "sum" => "∑",
        "prod" => "∏",
        "coprod" => "∐",
        "int" => "∫",
        "iint" => "∬",
        "oint" => "∮",
        "to" | "rightarrow" => "→",
        "leftarrow" | "gets" => "←",
        "Rightarrow" | "implies" => "⇒",
        "Leftarrow" => "⇐",
        "leftrightarrow" => "↔",
        "Leftrightarrow" | "iff" => "⇔",
        "mapsto" => "↦",
        "uparrow" => "↑",
        "downarrow" => "↓",
        "in" => "∈",
        "notin" => "∉",
        "ni" => "∋",
        "subset" => "⊂",
        "subseteq" => "⊆",
        "supset" => "⊃",
        "supseteq" => "⊇",
        "cup" => "∪",
        "cap" => "∩",
        "setminus" => "∖",
        "emptyset" | "varnothing" => "∅",
        "forall" => "∀",
        "exists" => "∃",
        "neg" | "lnot" => "¬",
        "land" | "wedge" => "∧",
        "lor" | "vee" => "∨",
        "oplus" => "⊕",
        "otimes" => "⊗",
        "cdots" => "⋯",
        "ldots" | "dots" => "…",
        "vdots" => "⋮",
        "ddots" => "⋱",
        "angle" => "∠",
        "perp" => "⊥",
        "parallel" => "∥",
        "mid" => "∣",
        "prime" => "′",
        "degree" => "°",
        "langle" => "⟨",
        "rangle" => "⟩",
        "lfloor" => "⌊",
        "rfloor" => "⌋",
        "lceil" => "⌈",
        "rceil" => "⌉",
        "hbar" => "ℏ",
        "ell" => "ℓ",
        "Re" => "ℜ",
        "Im" => "ℑ",
        "aleph" => "ℵ",
        _ => return None,
    };
    Some(symbol)
}

fn superscript(c: char) -> Option<char> {
    let mapped = match c {
        '0' => '⁰',
        '1' => '¹',
        '2' => '²',
        '3' => '³',
        '4' => '⁴',
        '5' => '⁵',
        '6' => '⁶',
        '7' => '⁷',
        '8' => '⁸',
        '9' => '⁹',
        '+' => '⁺',
        '-' | '−' => '⁻',
        '=' => '⁼',
        '(' => '⁽',
        ')' => '⁾',
        'a' => 'ᵃ',
        'b' => 'ᵇ',
        'c' => 'ᶜ',
        'd' => 'ᵈ',
        'e' => 'ᵉ',
        'f' => 'ᶠ',
        'g' => 'ᵍ',
        'h' => 'ʰ',
        'i' => 'ⁱ',
        'j' => 'ʲ',
        'k' => 'ᵏ',
        'l' => 'ˡ',
        'm' => 'ᵐ',
        'n' => 'ⁿ',
        'o' => 'ᵒ',
        'p' => 'ᵖ',
        'r' => 'ʳ',
        's' => 'ˢ',
        't' => 'ᵗ',
        'u' => 'ᵘ',
        'v' => 'ᵛ',
        'w' => 'ʷ',
        'x' => 'ˣ',
        'y' => 'ʸ',
        'z' => 'ᶻ',
        'A' => 'ᴬ',
        'B' => 'ᴮ',
        'D' => 'ᴰ',
        'E' => 'ᴱ',
        'G' => 'ᴳ',
        'H' => 'ᴴ',
        'I' => 'ᴵ',
        'J' => 'ᴶ',
        'K' => 'ᴷ',
        'L' => 'ᴸ',
        'M' => 'ᴹ',
        'N' => 'ᴺ',
        'O' => 'ᴼ',
        'P' => 'ᴾ',
        'R' => 'ᴿ',
        'T' => 'ᵀ',
        'U' => 'ᵁ',
        'V' => 'ⱽ',
        'W' => 'ᵂ',
        '′' => '′',
        _ => return None,
    };
    Some(mapped)
}

fn subscript(c: char) -> Option<char> {
    let mapped = match c {
        '0' => '₀',
        '1' => '₁',
        '2' => '₂',
        '3' => '₃',
        '4' => '₄',
        '5' => '₅',
        '6' => '₆',
        '7' => '₇',
        '8' => '₈',
        '9' => '₉',
        '+' => '₊',
        '-' | '−' => '₋',
        '=' => '₌',
        '(' => '₍',
        ')' => '₎',
        'a' => 'ₐ',
        'e' => 'ₑ',
        'h' => 'ₕ',
        'i' => 'ᵢ',
        'j' => 'ⱼ',
        'k' => 'ₖ',
        'l' => 'ₗ',
        'm' => 'ₘ',
        'n' => 'ₙ',
        'o' => 'ₒ',
        'p' => 'ₚ',
        'r' => 'ᵣ',
        's' => 'ₛ',
        't' => 'ₜ',
        'u' => 'ᵤ',
        'v' => 'ᵥ',
        'x' => 'ₓ',
        'β' => 'ᵦ',
        'γ' => 'ᵧ',
        'ρ' => 'ᵨ',
        'φ' | 'ϕ' => 'ᵩ',
        'χ' => 'ᵪ',
        _ => return None,
    };
    Some(mapped)
}

/// Raises or lowers `arg`, falling back to `^(...)` / `_(...)` when some
/// character has no Unicode script form.
fn script(arg: &str, raise: bool) -> String {
    let map = if raise { superscript } else { subscript };
    let compact = arg.chars().filter(|c| !c.is_whitespace());
    if let Some(mapped) = compact.clone().map(map).collect::<Option<String>>() {
        return mapped;
    }
    let marker = if raise { '^' } else { '_' };
    if arg.chars().count() == 1 {
        format!("{marker}{arg}")
    } else {
        format!("{marker}({})", compact.collect::<String>())
    }
}

fn fraction(numerator: &str, denominator: &str) -> String {
    let vulgar = match (numerator, denominator) {
        ("1", "2") => Some("½"),
        ("1", "3") => Some("⅓"),
        ("2", "3") => Some("⅔"),
        ("1", "4") => Some("¼"),
        ("3", "4") => Some("¾"),
        ("1", "8") => Some("⅛"),
        _ => None,
    };
    match vulgar {
        Some(glyph) => glyph.to_string(),
        None => format!(
            "{}/{}",
            parenthesize(numerator),
            parenthesize(denominator)
        ),
    }
}

fn parenthesize(term: &str) -> String {
    if term.chars().count() > 1 && !term.chars().all(char::is_alphanumeric) {
        format!("({term})")
    } else {
        term.to_string()
    }
}

fn double_struck(c: char) -> char {
    match c {
        'N' => 'ℕ',
        'Z' => 'ℤ',
        'Q' => 'ℚ',
        'R' => 'ℝ',
        'C' => 'ℂ',
        'P' => 'ℙ',
        'H' => 'ℍ',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typeset(source: &str) -> Result<String, MathError> {
        UnicodeTypesetter.typeset(&MathNode::inline(source))
    }

    #[test]
    fn scripts_become_unicode() {
        assert_eq!(typeset("x^2 + y^2 = z^2").unwrap(), "x² + y² = z²");
        assert_eq!(typeset("a_{n+1}").unwrap(), "aₙ₊₁");
        assert_eq!(typeset(r"\sum_{i=1}^{n} i").unwrap(), "∑ᵢ₌₁ⁿ i");
    }

    #[test]
    fn scripts_without_unicode_form_fall_back() {
        assert_eq!(typeset(r"e^{i\pi}").unwrap(), "e^(iπ)");
        assert_eq!(typeset("x_q").unwrap(), "x_q");
    }

    #[test]
    fn greek_and_operators() {
        assert_eq!(typeset(r"\alpha \cdot \beta \leq \infty").unwrap(), "α · β ≤ ∞");
        assert_eq!(typeset(r"\sin \theta").unwrap(), "sin θ");
    }

    #[test]
    fn fractions_and_roots() {
        assert_eq!(typeset(r"\frac{1}{2}").unwrap(), "½");
        assert_eq!(typeset(r"\frac{a+b}{c}").unwrap(), "(a+b)/c");
        assert_eq!(typeset(r"\frac{n(n+1)}{2}").unwrap(), "(n(n+1))/2");
        assert_eq!(typeset(r"\sqrt{x}").unwrap(), "√x");
        assert_eq!(typeset(r"\sqrt[3]{8}").unwrap(), "∛8");
        assert_eq!(typeset(r"\sqrt{b^2-4ac}").unwrap(), "√(b²-4ac)");
    }

    #[test]
    fn text_is_kept_verbatim() {
        assert_eq!(typeset(r"\text{area} = \pi r^2").unwrap(), "area = π r²");
        assert_eq!(typeset(r"\mathbb{R}").unwrap(), "ℝ");
    }

    #[test]
    fn errors() {
        assert_eq!(
            typeset(r"\foo").unwrap_err(),
            MathError::UnknownCommand("foo".into())
        );
        assert_eq!(typeset("{x").unwrap_err(), MathError::UnbalancedBraces);
        assert_eq!(typeset("x}").unwrap_err(), MathError::UnbalancedBraces);
        assert_eq!(typeset("x^").unwrap_err(), MathError::DanglingScript);
        assert_eq!(typeset("{x_}").unwrap_err(), MathError::DanglingScript);
        assert_eq!(
            typeset(r"\frac{1}").unwrap_err(),
            MathError::MissingArgument("frac".into())
        );
    }

    #[test]
    fn deep_nesting_is_an_error() {
        let braces = format!("{}x{}", "{".repeat(20_000), "}".repeat(20_000));
        assert_eq!(typeset(&braces).unwrap_err(), MathError::TooDeep);

        let roots = format!("{}x", r"\sqrt".repeat(10_000));
        assert_eq!(typeset(&roots).unwrap_err(), MathError::TooDeep);

        let shallow = format!("{}x{}", "{".repeat(20), "}".repeat(20));
        assert_eq!(typeset(&shallow).unwrap(), "x");
    }

    #[test]
    fn delimited_source() {
        assert_eq!(MathNode::inline("x").delimited(), "$x$");
        assert_eq!(MathNode::display("x").delimited(), "$$x$$");
    }
}
