//! Boolean query expressions as generated by the query agent: `&` joins terms that must
//! all match, `|` separates alternatives, and parentheses group. `&` binds tighter than
//! `|`, so `a & (b | c)` means `(a & b) | (a & c)`.

use unicode_normalization::UnicodeNormalization;

/// Upper bound on OR-groups after distributing `&` over parenthesized alternatives.
pub const MAX_EXPANDED_GROUPS: usize = 64;

/// Case-folding applied to search terms and to the searched text: NFKC, then Unicode
/// lowercase.
pub fn fold_search_text(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

/// Parses an expression into OR-groups of AND-terms (disjunctive normal form), folded with
/// [`fold_search_text`]. Quotes around terms are dropped and operators without operands
/// are ignored. Unbalanced parentheses, or an expansion beyond [`MAX_EXPANDED_GROUPS`],
/// yield no groups.
pub fn parse_query_expression(query: &str) -> Vec<Vec<String>> {
    let tokens = tokenize(query);
    let mut parser = Parser {
        tokens: &tokens,
        position: 0,
    };
    match parser.alternatives() {
        Ok(groups) if parser.position == tokens.len() => groups.unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub fn has_searchable_terms(query: &str) -> bool {
    !parse_query_expression(query).is_empty()
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Term(String),
}

fn tokenize(query: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut term = String::new();
    for c in query.chars() {
        let operator = match c {
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            '&' => Some(Token::And),
            '|' => Some(Token::Or),
            _ => None,
        };
        match operator {
            Some(token) => {
                push_term(&mut tokens, &mut term);
                tokens.push(token);
            }
            None => term.push(c),
        }
    }
    push_term(&mut tokens, &mut term);
    tokens
}

fn push_term(tokens: &mut Vec<Token>, term: &mut String) {
    let cleaned = term
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .trim();
    if !cleaned.is_empty() {
        tokens.push(Token::Term(fold_search_text(cleaned)));
    }
    term.clear();
}

/// `None` is a well-formed subexpression without terms, such as `()`.
type Groups = Option<Vec<Vec<String>>>;

struct Malformed;

struct Parser<'a> {
    tokens: &'a [Token],
    position: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn alternatives(&mut self) -> Result<Groups, Malformed> {
        let mut groups = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.position += 1;
            let next = self.conjunction()?;
            groups = match (groups, next) {
                (Some(mut left), Some(right)) => {
                    left.extend(right);
                    Some(left)
                }
                (left, right) => left.or(right),
            };
        }
        if groups.as_ref().is_some_and(|groups| groups.len() > MAX_EXPANDED_GROUPS) {
            return Err(Malformed);
        }
        Ok(groups)
    }

    fn conjunction(&mut self) -> Result<Groups, Malformed> {
        let mut groups = self.operand()?;
        while self.peek() == Some(&Token::And) {
            self.position += 1;
            let next = self.operand()?;
            groups = match (groups, next) {
                (Some(left), Some(right)) => Some(distribute(&left, &right)?),
                (left, right) => left.or(right),
            };
        }
        Ok(groups)
    }

    fn operand(&mut self) -> Result<Groups, Malformed> {
        match self.peek().cloned() {
            Some(Token::Term(term)) => {
                self.position += 1;
                Ok(Some(vec![vec![term]]))
            }
            Some(Token::Open) => {
                self.position += 1;
                let inner = self.alternatives()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(Malformed);
                }
                self.position += 1;
                Ok(inner)
            }
            // Operators without operands are ignored; a stray `)` is caught by the caller.
            Some(Token::Close | Token::And | Token::Or) | None => Ok(None),
        }
    }
}

fn distribute(
    left: &[Vec<String>],
    right: &[Vec<String>],
) -> Result<Vec<Vec<String>>, Malformed> {
    if left.len().saturating_mul(right.len()) > MAX_EXPANDED_GROUPS {
        return Err(Malformed);
    }
    let mut groups = Vec::with_capacity(left.len() * right.len());
    for first in left {
        for second in right {
            let mut group = first.clone();
            for term in second {
                if !group.contains(term) {
                    group.push(term.clone());
                }
            }
            groups.push(group);
        }
    }
    Ok(groups)
}
