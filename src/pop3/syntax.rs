//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Tridove.
//
// Tridove is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tridove is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tridove. If not, see <http://www.gnu.org/licenses/>.

use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Stat,
    List(Option<usize>),
    Retr(usize),
    Dele(usize),
    Noop,
    Rset,
    Quit,
    Top(usize, usize),
    Uidl(Option<usize>),
    Capa,
    Stls,
    Auth(Option<String>),
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let mut words = s.split_ascii_whitespace();
        let verb = words.next().ok_or(())?.to_ascii_uppercase();

        // USER and PASS take the whole remainder verbatim (passwords may
        // contain spaces); everything else splits on whitespace.
        if "USER" == verb || "PASS" == verb {
            let argument = s
                [s.find(|c: char| c.is_ascii_whitespace())
                    .unwrap_or(s.len())..]
                .trim();
            if argument.is_empty() {
                return Err(());
            }
            return Ok(if "USER" == verb {
                Command::User(argument.to_owned())
            } else {
                Command::Pass(argument.to_owned())
            });
        }

        let command = match verb.as_str() {
            "STAT" => Command::Stat,
            "LIST" => Command::List(optional_number(&mut words)?),
            "RETR" => Command::Retr(number(&mut words)?),
            "DELE" => Command::Dele(number(&mut words)?),
            "NOOP" => Command::Noop,
            "RSET" => Command::Rset,
            "QUIT" => Command::Quit,
            "TOP" => {
                let n = number(&mut words)?;
                let lines = number(&mut words)?;
                Command::Top(n, lines)
            },
            "UIDL" => Command::Uidl(optional_number(&mut words)?),
            "CAPA" => Command::Capa,
            "STLS" => Command::Stls,
            "AUTH" => {
                Command::Auth(words.next().map(str::to_ascii_uppercase))
            },
            _ => return Err(()),
        };

        // Trailing garbage after a complete command is a syntax error
        if words.next().is_some() {
            return Err(());
        }

        Ok(command)
    }
}

fn number(words: &mut std::str::SplitAsciiWhitespace) -> Result<usize, ()> {
    words.next().ok_or(())?.parse::<usize>().map_err(|_| ())
}

fn optional_number(
    words: &mut std::str::SplitAsciiWhitespace,
) -> Result<Option<usize>, ()> {
    match words.next() {
        Some(word) => word.parse::<usize>().map(Some).map_err(|_| ()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_parsing() {
        assert_eq!(
            Ok(Command::User("dib@earth.example".to_owned())),
            "USER dib@earth.example".parse()
        );
        assert_eq!(
            Ok(Command::User("dib@earth.example".to_owned())),
            "user dib@earth.example".parse()
        );
        assert_eq!(
            Ok(Command::Pass("pass with spaces".to_owned())),
            "PASS pass with spaces".parse()
        );
        assert_eq!(Err(()), "USER".parse::<Command>());
        assert_eq!(Err(()), "PASS".parse::<Command>());

        assert_eq!(Ok(Command::Stat), "STAT".parse());
        assert_eq!(Ok(Command::Stat), "stat".parse());
        assert_eq!(Err(()), "STAT 3".parse::<Command>());

        assert_eq!(Ok(Command::List(None)), "LIST".parse());
        assert_eq!(Ok(Command::List(Some(3))), "LIST 3".parse());
        assert_eq!(Err(()), "LIST three".parse::<Command>());

        assert_eq!(Ok(Command::Retr(1)), "RETR 1".parse());
        assert_eq!(Err(()), "RETR".parse::<Command>());
        assert_eq!(Err(()), "RETR 1 2".parse::<Command>());

        assert_eq!(Ok(Command::Dele(2)), "DELE 2".parse());
        assert_eq!(Ok(Command::Noop), "NOOP".parse());
        assert_eq!(Ok(Command::Rset), "RSET".parse());
        assert_eq!(Ok(Command::Quit), "QUIT".parse());

        assert_eq!(Ok(Command::Top(2, 5)), "TOP 2 5".parse());
        assert_eq!(Err(()), "TOP 2".parse::<Command>());

        assert_eq!(Ok(Command::Uidl(None)), "UIDL".parse());
        assert_eq!(Ok(Command::Uidl(Some(7))), "UIDL 7".parse());

        assert_eq!(Ok(Command::Capa), "CAPA".parse());
        assert_eq!(Ok(Command::Stls), "STLS".parse());

        assert_eq!(Ok(Command::Auth(None)), "AUTH".parse());
        assert_eq!(
            Ok(Command::Auth(Some("PLAIN".to_owned()))),
            "AUTH plain".parse()
        );

        assert_eq!(Err(()), "".parse::<Command>());
        assert_eq!(Err(()), "XYZZY".parse::<Command>());
    }
}
