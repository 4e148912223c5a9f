//! PGN ingestion front door. Parsing and move legality are delegated
//! entirely to `pgn-reader`/`shakmaty` — chessmate treats both as an
//! external collaborator assumed correct and only extracts what the
//! retrieval pipeline needs: per-game headers and one FEN per ply.

use std::collections::HashMap;
use std::io::Read;

use pgn_reader::{BufferedReader, RawHeader, SanPlus, Skip, Visitor};
use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::{Chess, EnPassantMode, Position};

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct ParsedPosition {
    pub ply: i32,
    pub san: String,
    pub fen: String,
    pub side_to_move: char,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedGame {
    pub headers: HashMap<String, String>,
    pub positions: Vec<ParsedPosition>,
}

/// Parses every game in a PGN file. A game whose movetext can't be fully
/// replayed (illegal or ambiguous SAN) is dropped with a warning rather
/// than failing the whole ingest.
pub fn parse_pgn(mut reader: impl Read, warnings: &mut Vec<String>) -> Result<Vec<ParsedGame>, AppError> {
    let mut buffered = BufferedReader::new(&mut reader);
    let mut games = Vec::new();
    let mut index = 0usize;

    loop {
        let mut visitor = GameVisitor::default();
        match buffered.read_game(&mut visitor) {
            Ok(Some(Some(game))) => {
                index += 1;
                games.push(game);
            }
            Ok(Some(None)) => {
                index += 1;
                warnings.push(format!("game {index} skipped: illegal or unparseable movetext"));
            }
            Ok(None) => break,
            Err(e) => return Err(AppError::Validation(format!("pgn parse error: {e}"))),
        }
    }

    Ok(games)
}

#[derive(Default)]
struct GameVisitor {
    headers: HashMap<String, String>,
    position: Chess,
    ply: i32,
    positions: Vec<ParsedPosition>,
    broken: bool,
}

impl Visitor for GameVisitor {
    type Result = Option<ParsedGame>;

    fn begin_game(&mut self) {
        self.headers.clear();
        self.position = Chess::default();
        self.ply = 0;
        self.positions.clear();
        self.broken = false;
    }

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        let key = String::from_utf8_lossy(key).to_string();
        let value = String::from_utf8_lossy(value.as_bytes()).to_string();
        self.headers.insert(key, value);
    }

    fn end_headers(&mut self) -> Skip {
        Skip(false)
    }

    fn san(&mut self, san_plus: SanPlus) {
        if self.broken {
            return;
        }
        let san: San = san_plus.san;
        let mv = match san.to_move(&self.position) {
            Ok(mv) => mv,
            Err(_) => {
                self.broken = true;
                return;
            }
        };
        self.position = match self.position.clone().play(&mv) {
            Ok(pos) => pos,
            Err(_) => {
                self.broken = true;
                return;
            }
        };
        self.ply += 1;
        let fen = Fen::from_position(self.position.clone(), EnPassantMode::Legal).to_string();
        let side_to_move = if self.position.turn().is_white() { 'w' } else { 'b' };
        self.positions.push(ParsedPosition {
            ply: self.ply,
            san: san_plus.to_string(),
            fen,
            side_to_move,
        });
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true)
    }

    fn end_variation(&mut self) {}

    fn end_game(&mut self) -> Self::Result {
        if self.broken || self.positions.is_empty() {
            None
        } else {
            Some(ParsedGame {
                headers: std::mem::take(&mut self.headers),
                positions: std::mem::take(&mut self.positions),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_GAME: &str = r#"[Event "Test Open"]
[Site "Testville"]
[Date "2024.01.15"]
[Round "1"]
[White "Alice"]
[Black "Bob"]
[Result "1-0"]
[WhiteElo "2100"]
[BlackElo "2050"]
[ECO "B01"]

1. e4 d5 2. exd5 Qxd5 3. Nc3 Qd6 1-0
"#;

    #[test]
    fn parses_headers_and_positions() {
        let mut warnings = Vec::new();
        let games = parse_pgn(SIMPLE_GAME.as_bytes(), &mut warnings).unwrap();
        assert_eq!(games.len(), 1);
        let game = &games[0];
        assert_eq!(game.headers.get("White").map(String::as_str), Some("Alice"));
        assert_eq!(game.headers.get("ECO").map(String::as_str), Some("B01"));
        assert_eq!(game.positions.len(), 6);
        assert_eq!(game.positions[0].ply, 1);
        assert!(game.positions[0].fen.contains(" b "));
        assert_eq!(game.positions.last().unwrap().side_to_move, 'w');
    }

    #[test]
    fn multiple_games_are_all_parsed() {
        let pgn = format!("{SIMPLE_GAME}\n{SIMPLE_GAME}");
        let mut warnings = Vec::new();
        let games = parse_pgn(pgn.as_bytes(), &mut warnings).unwrap();
        assert_eq!(games.len(), 2);
    }

    #[test]
    fn empty_input_yields_no_games() {
        let mut warnings = Vec::new();
        let games = parse_pgn("".as_bytes(), &mut warnings).unwrap();
        assert!(games.is_empty());
        assert!(warnings.is_empty());
    }
}
